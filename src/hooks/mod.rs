//! Callback intake
//!
//! The webhook endpoint drops every inbound command callback onto a bounded
//! queue; a small worker pool drains it and dispatches into the coordinator.
//! A CREATE_SESSION callback can outrun the job row it refers to, so the
//! router requeues those a few times before giving up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cc::{Cmd, CmdKind, StepIdentifier};
use crate::coordinator::JobCoordinator;

/// Attempts before a CREATE_SESSION callback for an invisible job is dropped.
pub const RETRY_LIMIT: u32 = 5;
/// Pause between those attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// One inbound webhook delivery.
#[derive(Debug, Clone)]
pub struct CallbackItem {
    /// Raw identifier from the webhook query: a job id for session
    /// callbacks, a JSON `{jobId, path}` object for step callbacks.
    pub identifier: String,
    pub cmd: Cmd,
    pub retry_count: u32,
}

impl CallbackItem {
    pub fn new(identifier: String, cmd: Cmd) -> Self {
        Self {
            identifier,
            cmd,
            retry_count: 0,
        }
    }
}

/// Spawn `workers` tasks draining a bounded callback queue. Returns the
/// sender handed to the webhook endpoint; workers exit when it is dropped.
pub fn start_router(
    coordinator: Arc<JobCoordinator>,
    workers: usize,
    capacity: usize,
) -> (mpsc::Sender<CallbackItem>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let rx = rx.clone();
        // weak so in-flight retries never keep the queue alive past shutdown
        let requeue_tx = tx.downgrade();
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            debug!("Callback worker {} started", worker);
            loop {
                let item = { rx.lock().await.recv().await };
                let Some(item) = item else { break };
                process(&coordinator, &requeue_tx, item).await;
            }
            debug!("Callback worker {} stopped", worker);
        }));
    }
    (tx, handles)
}

/// Classify one callback and dispatch it into the coordinator.
async fn process(
    coordinator: &JobCoordinator,
    tx: &mpsc::WeakSender<CallbackItem>,
    item: CallbackItem,
) {
    match item.cmd.kind {
        CmdKind::CreateSession => {
            let job_id = match Uuid::parse_str(&item.identifier) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Bad session callback identifier '{}': {}", item.identifier, e);
                    return;
                }
            };

            if coordinator.find_job(job_id).await.is_none() {
                if item.retry_count < RETRY_LIMIT {
                    debug!(
                        "Job {} not visible yet, retry {} of {}",
                        job_id,
                        item.retry_count + 1,
                        RETRY_LIMIT
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                    let requeue = CallbackItem {
                        retry_count: item.retry_count + 1,
                        ..item
                    };
                    match tx.upgrade() {
                        Some(tx) if tx.send(requeue).await.is_ok() => {}
                        _ => warn!("Callback queue closed, dropping retry for job {}", job_id),
                    }
                } else {
                    warn!("Job {} not found after {} retries, dropping", job_id, RETRY_LIMIT);
                }
                return;
            }

            if let Err(e) = coordinator.handle_session_callback(job_id, &item.cmd).await {
                warn!("Session callback for job {} failed: {}", job_id, e);
            }
        }
        CmdKind::RunShell => {
            let identifier: StepIdentifier = match serde_json::from_str(&item.identifier) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Bad step callback identifier '{}': {}", item.identifier, e);
                    return;
                }
            };

            if coordinator.find_job(identifier.job_id).await.is_none() {
                warn!("Job {} not found for step callback, dropping", identifier.job_id);
                return;
            }

            if let Err(e) = coordinator
                .handle_step_callback(identifier.job_id, &identifier.path, &item.cmd)
                .await
            {
                warn!(
                    "Step callback for job {} path '{}' failed: {}",
                    identifier.job_id, identifier.path, e
                );
            }
        }
        other => {
            warn!("Dropping callback with unhandled cmd kind {:?}", other);
        }
    }
}
