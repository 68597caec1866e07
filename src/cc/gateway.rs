use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::{Cmd, CmdInfo};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Empty response from command-control at {0}")]
    EmptyResponse(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Command-control error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// Fire-and-await RPCs against the command-control service.
///
/// Implementations are stateless; callers must not hold any per-job lock
/// across these calls.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    /// Enqueue a session command (CREATE_SESSION / DELETE_SESSION) on the
    /// command-control queue.
    async fn enqueue_session(&self, info: &CmdInfo) -> Result<Cmd, GatewayError>;

    /// Dispatch a RUN_SHELL step command synchronously.
    async fn post_step(&self, info: &CmdInfo) -> Result<Cmd, GatewayError>;

    /// Ask command-control to kill an outstanding command.
    async fn post_stop(&self, cmd_id: &str) -> Result<(), GatewayError>;
}

/// Real HTTP gateway backed by reqwest.
#[derive(Clone)]
pub struct HttpCommandGateway {
    client: reqwest::Client,
    queue_url: String,
    cmd_url: String,
    cmd_stop_url: String,
}

impl HttpCommandGateway {
    pub fn new(queue_url: String, cmd_url: String, cmd_stop_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            queue_url,
            cmd_url,
            cmd_stop_url,
        }
    }

    async fn post_cmd_info(&self, url: &str, info: &CmdInfo) -> Result<Cmd, GatewayError> {
        let response = self
            .client
            .post(url)
            .json(info)
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(GatewayError::EmptyResponse(url.to_string()));
        }

        serde_json::from_str(&text).map_err(|e| GatewayError::Parse(e.to_string()))
    }
}

#[async_trait]
impl CommandGateway for HttpCommandGateway {
    async fn enqueue_session(&self, info: &CmdInfo) -> Result<Cmd, GatewayError> {
        let url = format!("{}?priority=1&retry=5", self.queue_url);
        debug!("Enqueueing {:?} via {}", info.kind, url);
        self.post_cmd_info(&url, info).await
    }

    async fn post_step(&self, info: &CmdInfo) -> Result<Cmd, GatewayError> {
        debug!("Posting step cmd via {}", self.cmd_url);
        self.post_cmd_info(&self.cmd_url, info).await
    }

    async fn post_stop(&self, cmd_id: &str) -> Result<(), GatewayError> {
        let url = format!("{}/{}", self.cmd_stop_url.trim_end_matches('/'), cmd_id);
        debug!("Posting stop via {}", url);
        let response = self
            .client
            .post(&url)
            .body("")
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    use std::sync::Mutex;

    use super::*;
    use crate::cc::{CmdKind, CmdStatus};

    /// Recording gateway for unit tests: captures every dispatched CmdInfo
    /// and answers with SENT descriptors carrying predictable ids.
    pub struct MockGateway {
        pub sessions: Mutex<Vec<CmdInfo>>,
        pub steps: Mutex<Vec<CmdInfo>>,
        pub stops: Mutex<Vec<String>>,
        pub fail_steps: bool,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                sessions: Mutex::new(Vec::new()),
                steps: Mutex::new(Vec::new()),
                stops: Mutex::new(Vec::new()),
                fail_steps: false,
            }
        }

        pub fn failing_steps() -> Self {
            Self {
                fail_steps: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl CommandGateway for MockGateway {
        async fn enqueue_session(&self, info: &CmdInfo) -> Result<Cmd, GatewayError> {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.push(info.clone());
            Ok(Cmd {
                id: format!("session-cmd-{}", sessions.len()),
                kind: info.kind,
                status: CmdStatus::Pending,
                session_id: info.session_id.clone(),
                cmd_result: None,
                log_paths: Vec::new(),
                finished_date: None,
            })
        }

        async fn post_step(&self, info: &CmdInfo) -> Result<Cmd, GatewayError> {
            if self.fail_steps {
                return Err(GatewayError::Http("connection refused".into()));
            }
            let mut steps = self.steps.lock().unwrap();
            steps.push(info.clone());
            Ok(Cmd {
                id: format!("step-cmd-{}", steps.len()),
                kind: CmdKind::RunShell,
                status: CmdStatus::Pending,
                session_id: info.session_id.clone(),
                cmd_result: None,
                log_paths: Vec::new(),
                finished_date: None,
            })
        }

        async fn post_stop(&self, cmd_id: &str) -> Result<(), GatewayError> {
            self.stops.lock().unwrap().push(cmd_id.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::CmdKind;

    #[tokio::test]
    async fn test_mock_gateway_records_dispatches() {
        let gw = mock::MockGateway::new();
        let info = CmdInfo::session("default", CmdKind::CreateSession, None);

        let cmd = gw.enqueue_session(&info).await.unwrap();
        assert_eq!(cmd.id, "session-cmd-1");
        assert_eq!(gw.sessions.lock().unwrap().len(), 1);

        gw.post_stop("cmd-9").await.unwrap();
        assert_eq!(gw.stops.lock().unwrap()[0], "cmd-9");
    }

    #[tokio::test]
    async fn test_mock_gateway_failing_steps() {
        let gw = mock::MockGateway::failing_steps();
        let info = CmdInfo::shell("default", "session-1", "echo hi");
        assert!(gw.post_step(&info).await.is_err());
    }
}
