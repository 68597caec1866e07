//! Job coordinator
//!
//! Drives the job state machine: creates jobs, walks the flow tree top-down,
//! reconciles asynchronous command callbacks bottom-up, and brackets the run
//! with session creation and release.
//!
//! All state mutation for one job happens under that job's lock. Gateway
//! calls never run under it: callback handling computes the follow-up work
//! (dispatch the next step, release the session) while locked, then performs
//! the HTTP calls after the lock is dropped.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cc::{
    urlencoded, Cmd, CmdInfo, CmdKind, CmdStatus, CommandGateway, GatewayError, StepIdentifier,
};
use crate::config::Settings;
use crate::job::{map_status, merge_envs, Job, NodeResult, NodeStatus, NodeTag};
use crate::store::{JobStore, ResultStore, Store, StoreError, YmlStore};
use crate::tree::{self, FlowRegistry, NodeId, NodeTree};

/// Root env key gating job creation.
pub const FLOW_STATUS: &str = "FLOW_STATUS";
pub const FLOW_STATUS_READY: &str = "READY";

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Follow-up work computed under the job lock, executed after it is dropped.
enum Effect {
    RunNext(NodeId),
    ReleaseSession,
}

pub struct JobCoordinator {
    settings: Arc<Settings>,
    flows: Arc<FlowRegistry>,
    store: Arc<dyn Store + Send + Sync>,
    gateway: Arc<dyn CommandGateway>,
    job_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Serializes create_job per flow name so build numbers stay strict.
    create_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JobCoordinator {
    pub fn new(
        settings: Arc<Settings>,
        flows: Arc<FlowRegistry>,
        store: Arc<dyn Store + Send + Sync>,
        gateway: Arc<dyn CommandGateway>,
    ) -> Self {
        Self {
            settings,
            flows,
            store,
            gateway,
            job_locks: DashMap::new(),
            create_locks: DashMap::new(),
        }
    }

    /// Create a job for the flow owning `flow_path`, materialize its result
    /// set and enqueue session creation. Returns the persisted job.
    pub async fn create_job(&self, flow_path: &str) -> Result<Job, CoordinatorError> {
        let root_path = tree::root_path(flow_path);
        let entry = self
            .flows
            .find(root_path)
            .ok_or_else(|| CoordinatorError::InvalidParam(format!("Path does not exist: {flow_path}")))?;

        let root = entry.tree.node(entry.tree.root());
        let flow_status = root.envs.get(FLOW_STATUS).map(String::as_str);
        if flow_status != Some(FLOW_STATUS_READY) {
            return Err(CoordinatorError::IllegalState(format!(
                "Cannot create job since flow status is not {FLOW_STATUS_READY}"
            )));
        }
        if entry.yml.trim().is_empty() {
            return Err(CoordinatorError::IllegalState(format!(
                "Yml is not loaded for path {root_path}"
            )));
        }

        let mut job = {
            let create_lock = self.create_lock(root_path);
            let _guard = create_lock.lock().await;

            let number = self.store.max_build_number(&root.name).await + 1;
            let job = Job::new(&root.path, &root.name, number, root.envs.clone());
            let job = self.store.save(job).await?;
            self.store.save_yml(job.id, &entry.yml).await?;

            let results = entry
                .tree
                .iter_preorder()
                .map(|id| {
                    NodeResult::new(
                        job.id,
                        &entry.tree.node(id).path,
                        tag_of(&entry.tree, id),
                    )
                })
                .collect();
            self.store.create_many(results).await?;
            job
        };

        info!("Created job {} for flow '{}' #{}", job.id, job.node_name, job.number);

        let mut cmd_info =
            CmdInfo::session(&self.settings.zone, CmdKind::CreateSession, None);
        cmd_info.webhook = Some(self.job_hook(&job));

        let cmd = match self.gateway.enqueue_session(&cmd_info).await {
            Ok(cmd) => cmd,
            Err(GatewayError::EmptyResponse(_)) => {
                return Err(CoordinatorError::IllegalState(
                    "Unable to create session since cmd returned empty".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        job.cmd_id = Some(cmd.id);
        job.touch();
        JobStore::update(&*self.store, &job).await?;
        Ok(job)
    }

    /// CREATE_SESSION callback: on SENT, record the session and start the
    /// first leaf. Anything else is logged and ignored.
    pub async fn handle_session_callback(
        &self,
        job_id: Uuid,
        cmd: &Cmd,
    ) -> Result<(), CoordinatorError> {
        if cmd.status != CmdStatus::Sent {
            warn!(
                "Create session for job {} reported status {:?}, ignoring",
                job_id, cmd.status
            );
            return Ok(());
        }

        let tree = self.job_tree(job_id).await?;
        let first = {
            let lock = self.job_lock(job_id);
            let _guard = lock.lock().await;

            let mut job = self
                .store
                .get(job_id)
                .await
                .ok_or_else(|| CoordinatorError::NotFound(format!("job {job_id}")))?;
            if job.session_id.is_some() {
                warn!("Job {} already has a session, ignoring duplicate SENT", job_id);
                return Ok(());
            }
            let session_id = cmd.session_id.clone().ok_or_else(|| {
                CoordinatorError::IllegalState("SENT callback without session id".into())
            })?;
            job.session_id = Some(session_id);
            job.touch();
            JobStore::update(&*self.store, &job).await?;
            tree.first_leaf(tree.root())
        };

        if let Some(first) = first {
            self.run_from(&tree, first, job_id).await?;
        }
        Ok(())
    }

    /// RUN_SHELL callback for one node path.
    pub async fn handle_step_callback(
        &self,
        job_id: Uuid,
        path: &str,
        cmd: &Cmd,
    ) -> Result<(), CoordinatorError> {
        let new_status = match map_status(cmd) {
            Ok(status) => status,
            Err(e) => {
                warn!("Dropping callback for job {}: {}", job_id, e);
                return Ok(());
            }
        };

        let tree = self.job_tree(job_id).await?;
        let node_id = tree
            .find(path)
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {path}")))?;

        let effects = {
            let lock = self.job_lock(job_id);
            let _guard = lock.lock().await;

            let current = self
                .store
                .find(path, job_id)
                .await
                .ok_or_else(|| CoordinatorError::NotFound(format!("result {path}")))?;
            if current.status.level() >= new_status.level() {
                debug!(
                    "Dropping {:?} for {}: already {:?}",
                    new_status, path, current.status
                );
                return Ok(());
            }

            self.apply_status(&tree, node_id, new_status, Some(cmd), job_id)
                .await?
        };

        self.perform(&tree, effects, job_id).await
    }

    /// Stop a job: mark everything not yet SUCCESS as STOPPED, then ask
    /// command-control to kill the outstanding command.
    pub async fn stop_job(
        &self,
        flow_name: &str,
        number: u32,
    ) -> Result<Job, CoordinatorError> {
        let job = self
            .store
            .get_by_number(flow_name, number)
            .await
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!("job {flow_name} #{number}"))
            })?;

        let (job, cmd_id) = {
            let lock = self.job_lock(job.id);
            let _guard = lock.lock().await;

            let mut job = self
                .store
                .get(job.id)
                .await
                .ok_or_else(|| CoordinatorError::NotFound(format!("job {}", job.id)))?;
            let root_result = self
                .store
                .find(&job.node_path, job.id)
                .await
                .ok_or_else(|| {
                    CoordinatorError::NotFound(format!("node result for {flow_name}"))
                })?;

            let cmd_id = match root_result.status {
                NodeStatus::Enqueue | NodeStatus::Pending => {
                    job.cmd_id.clone().ok_or_else(|| {
                        CoordinatorError::NotFound("session cmd id".into())
                    })?
                }
                NodeStatus::Success | NodeStatus::Failure => {
                    return Err(CoordinatorError::InvalidParam(
                        "Cannot stop, job already finished".into(),
                    ));
                }
                _ => {
                    let running = self
                        .store
                        .find_by_status(job.id, NodeStatus::Running, NodeTag::Step)
                        .await
                        .ok_or_else(|| {
                            CoordinatorError::NotFound("running step result".into())
                        })?;
                    running.cmd_id.ok_or_else(|| {
                        CoordinatorError::NotFound("running step cmd id".into())
                    })?
                }
            };

            for mut result in ResultStore::list(&*self.store, job.id).await {
                if result.status != NodeStatus::Success {
                    result.status = NodeStatus::Stopped;
                    result.updated_at = chrono::Utc::now();
                    ResultStore::update(&*self.store, &result).await?;
                }
            }
            job.touch();
            JobStore::update(&*self.store, &job).await?;
            (job, cmd_id)
        };

        info!("Stopping job {} via cmd {}", job.id, cmd_id);
        if let Err(e) = self.gateway.post_stop(&cmd_id).await {
            // results are already marked; the caller still gets the job back
            warn!("Stop request for job {} failed downstream: {}", job.id, e);
        }
        Ok(job)
    }

    pub async fn find_job(&self, id: Uuid) -> Option<Job> {
        self.store.get(id).await
    }

    pub async fn find_job_by_number(
        &self,
        flow_name: &str,
        number: u32,
    ) -> Result<Job, CoordinatorError> {
        self.store
            .get_by_number(flow_name, number)
            .await
            .ok_or_else(|| CoordinatorError::NotFound(format!("job {flow_name} #{number}")))
    }

    /// All jobs, jobs of one flow, or the latest job per flow name.
    pub async fn list_jobs(
        &self,
        flow_name: Option<&str>,
        flow_names: Option<&[String]>,
    ) -> Vec<Job> {
        if let Some(names) = flow_names {
            return self.store.list_latest(names).await;
        }
        if let Some(name) = flow_name {
            return self.store.list_for_flow(name).await;
        }
        JobStore::list(&*self.store).await
    }

    pub async fn list_node_results(
        &self,
        flow_name: &str,
        number: u32,
    ) -> Result<Vec<NodeResult>, CoordinatorError> {
        let job = self.find_job_by_number(flow_name, number).await?;
        Ok(ResultStore::list(&*self.store, job.id).await)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Walk from `start` to the next runnable leaf and dispatch it. A failed
    /// dispatch marks the step FAILURE and continues the walk the same way a
    /// failure callback would, so a dropped RPC cannot wedge the pipeline.
    async fn run_from(
        &self,
        tree: &NodeTree,
        start: NodeId,
        job_id: Uuid,
    ) -> Result<(), CoordinatorError> {
        let mut cursor = Some(start);
        while let Some(node_id) = cursor {
            if !tree.runnable(node_id) {
                cursor = tree.next_leaf(node_id);
                continue;
            }

            let node = tree.node(node_id);
            let root = tree.node(tree.root());

            let job = self
                .store
                .get(job_id)
                .await
                .ok_or_else(|| CoordinatorError::NotFound(format!("job {job_id}")))?;
            let session_id = job.session_id.clone().ok_or_else(|| {
                CoordinatorError::IllegalState("Job has no session".into())
            })?;

            // flow envs win over step-local values
            let mut inputs = node.envs.clone();
            merge_envs(&mut inputs, &root.envs, true);

            let mut cmd_info = CmdInfo::shell(
                &self.settings.zone,
                &session_id,
                node.script().unwrap_or_default(),
            );
            cmd_info.inputs = inputs;
            cmd_info.output_env_filter = Some(self.settings.output_env_filter.clone());
            cmd_info.webhook = Some(self.node_hook(&node.path, job_id));

            info!("Dispatching step '{}' for job {}", node.path, job_id);
            match self.gateway.post_step(&cmd_info).await {
                Ok(cmd) => {
                    let lock = self.job_lock(job_id);
                    let _guard = lock.lock().await;
                    if let Some(mut result) = self.store.find(&node.path, job_id).await {
                        result.cmd_id = Some(cmd.id);
                        result.updated_at = chrono::Utc::now();
                        ResultStore::update(&*self.store, &result).await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Step dispatch failed for '{}' in job {}: {}",
                        node.path, job_id, e
                    );
                    let effects = {
                        let lock = self.job_lock(job_id);
                        let _guard = lock.lock().await;
                        self.apply_status(tree, node_id, NodeStatus::Failure, None, job_id)
                            .await?
                    };
                    cursor = None;
                    for effect in effects {
                        match effect {
                            Effect::RunNext(next) => cursor = Some(next),
                            Effect::ReleaseSession => self.delete_session(job_id).await?,
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Raise `node_id` to `status` and bubble the change toward the root.
    /// Must be called under the job lock; returns the follow-up effects.
    async fn apply_status(
        &self,
        tree: &NodeTree,
        node_id: NodeId,
        status: NodeStatus,
        cmd: Option<&Cmd>,
        job_id: Uuid,
    ) -> Result<Vec<Effect>, CoordinatorError> {
        let mut effects = Vec::new();
        let cmd_result = cmd.and_then(|c| c.cmd_result.as_ref());

        let mut cursor = Some(node_id);
        while let Some(cur) = cursor {
            let node = tree.node(cur);
            let mut result = self
                .store
                .find(&node.path, job_id)
                .await
                .ok_or_else(|| CoordinatorError::NotFound(format!("result {}", node.path)))?;

            if !result.raise(status) {
                // the parent is already at or above this level; nothing more
                // can change further up
                break;
            }

            let parent = tree.parent(cur);
            let mut next_up = None;
            match status {
                NodeStatus::Pending | NodeStatus::Running => {
                    if let Some(res) = cmd_result {
                        if res.start_time.is_some() {
                            result.start_time = res.start_time;
                        }
                    }
                    // first child starting pulls its parent along
                    if parent.is_some() && tree.prev_sibling(cur).is_none() {
                        next_up = parent;
                    }
                }
                NodeStatus::Success => {
                    if let Some(res) = cmd_result {
                        if res.finish_time.is_some() {
                            result.finish_time = res.finish_time;
                        }
                    }
                    if parent.is_some() {
                        if tree.next_sibling(cur).is_none() {
                            next_up = parent;
                        } else if let Some(next) = tree.next_leaf_after(cur) {
                            effects.push(Effect::RunNext(next));
                        }
                    }
                }
                NodeStatus::Failure | NodeStatus::Timeout => {
                    if let Some(res) = cmd_result {
                        if res.finish_time.is_some() {
                            result.finish_time = res.finish_time;
                        }
                    }
                    let allow_failure = node.allow_failure();
                    let has_next = tree.next_sibling(cur).is_some();
                    if parent.is_some() && allow_failure && !has_next {
                        next_up = parent;
                    }
                    if parent.is_some() && !allow_failure {
                        next_up = parent;
                    }
                    if has_next && allow_failure {
                        if let Some(next) = tree.next_leaf_after(cur) {
                            effects.push(Effect::RunNext(next));
                        }
                    }
                }
                NodeStatus::Stopped => {
                    if let Some(res) = cmd_result {
                        if res.finish_time.is_some() {
                            result.finish_time = res.finish_time;
                        }
                    }
                }
                NodeStatus::Enqueue => {}
            }

            result.refresh_duration();

            // terminal flow root releases the session, exactly once
            if parent.is_none() && !tree.runnable(cur) {
                let coalesced = match result.status {
                    NodeStatus::Timeout => NodeStatus::Failure,
                    other => other,
                };
                if matches!(coalesced, NodeStatus::Success | NodeStatus::Failure) {
                    effects.push(Effect::ReleaseSession);
                }
            }

            ResultStore::update(&*self.store, &result).await?;
            cursor = next_up;
        }

        if let Some(cmd) = cmd {
            self.update_node_info(tree, node_id, cmd, job_id).await?;
        }
        Ok(effects)
    }

    /// Copy execution details from the command onto the node's result and
    /// every ancestor: exit code, log paths (leaf only), start/finish times,
    /// duration, and the output env (existing keys kept).
    async fn update_node_info(
        &self,
        tree: &NodeTree,
        node_id: NodeId,
        cmd: &Cmd,
        job_id: Uuid,
    ) -> Result<(), CoordinatorError> {
        let Some(cmd_result) = &cmd.cmd_result else {
            return Ok(());
        };

        let mut cursor = Some(node_id);
        while let Some(cur) = cursor {
            let node = tree.node(cur);
            let mut result = self
                .store
                .find(&node.path, job_id)
                .await
                .ok_or_else(|| CoordinatorError::NotFound(format!("result {}", node.path)))?;

            result.exit_code = cmd_result.exit_value;
            if tree.runnable(cur) {
                result.log_paths = cmd.log_paths.clone();
            }
            if result.start_time.is_none() {
                result.start_time = cmd_result.start_time;
            }
            if let Some(finished) = cmd.finished_date {
                result.finish_time = Some(finished);
            }
            result.refresh_duration();
            merge_envs(&mut result.outputs, &cmd_result.output, false);
            result.updated_at = chrono::Utc::now();

            ResultStore::update(&*self.store, &result).await?;
            cursor = tree.parent(cur);
        }
        Ok(())
    }

    /// Enqueue DELETE_SESSION for the job, at most once. The response is
    /// ignored; no webhook is attached.
    async fn delete_session(&self, job_id: Uuid) -> Result<(), CoordinatorError> {
        let session_id = {
            let lock = self.job_lock(job_id);
            let _guard = lock.lock().await;

            let mut job = self
                .store
                .get(job_id)
                .await
                .ok_or_else(|| CoordinatorError::NotFound(format!("job {job_id}")))?;
            if job.session_released {
                return Ok(());
            }
            job.session_released = true;
            job.touch();
            JobStore::update(&*self.store, &job).await?;
            job.session_id
        };

        info!("Releasing session {:?} for job {}", session_id, job_id);
        let cmd_info = CmdInfo::session(&self.settings.zone, CmdKind::DeleteSession, session_id);
        if let Err(e) = self.gateway.enqueue_session(&cmd_info).await {
            warn!("Delete session for job {} failed: {}", job_id, e);
        }
        Ok(())
    }

    async fn perform(
        &self,
        tree: &NodeTree,
        effects: Vec<Effect>,
        job_id: Uuid,
    ) -> Result<(), CoordinatorError> {
        for effect in effects {
            match effect {
                Effect::RunNext(next) => self.run_from(tree, next, job_id).await?,
                Effect::ReleaseSession => self.delete_session(job_id).await?,
            }
        }
        Ok(())
    }

    /// Rebuild the node tree a job runs from its yml snapshot, so redefining
    /// a flow never changes a job that is already in flight.
    async fn job_tree(&self, job_id: Uuid) -> Result<NodeTree, CoordinatorError> {
        let yml = self
            .store
            .get_yml(job_id)
            .await
            .ok_or_else(|| CoordinatorError::NotFound(format!("yml for job {job_id}")))?;
        tree::parse_flow(&yml)
            .map_err(|e| CoordinatorError::IllegalState(format!("Bad yml snapshot: {e}")))
    }

    fn job_hook(&self, job: &Job) -> String {
        format!(
            "{}/hooks/cmd?identifier={}",
            self.settings.domain,
            urlencoded(&job.id.to_string())
        )
    }

    fn node_hook(&self, path: &str, job_id: Uuid) -> String {
        let identifier = StepIdentifier {
            job_id,
            path: path.to_string(),
        };
        let json = serde_json::to_string(&identifier).unwrap_or_default();
        format!(
            "{}/hooks/cmd?identifier={}",
            self.settings.domain,
            urlencoded(&json)
        )
    }

    fn job_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.job_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn create_lock(&self, flow: &str) -> Arc<Mutex<()>> {
        self.create_locks
            .entry(flow.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn tag_of(tree: &NodeTree, id: NodeId) -> NodeTag {
    if tree.parent(id).is_none() {
        NodeTag::Flow
    } else if tree.runnable(id) {
        NodeTag::Step
    } else {
        NodeTag::Group
    }
}
