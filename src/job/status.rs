//! Command status → node status translation.

use thiserror::Error;

use crate::cc::{Cmd, CmdStatus};

use super::NodeStatus;

#[derive(Error, Debug)]
#[error("Unmapped command status: {0:?}")]
pub struct BadStatus(pub CmdStatus);

/// Translate an external command's status into the node status ladder.
///
/// `LOGGED` needs the exit code to decide between success and failure; a
/// LOGGED cmd without a result counts as failure.
pub fn map_status(cmd: &Cmd) -> Result<NodeStatus, BadStatus> {
    let status = match cmd.status {
        CmdStatus::Sent | CmdStatus::Pending => NodeStatus::Pending,
        CmdStatus::Running | CmdStatus::Executed => NodeStatus::Running,
        CmdStatus::Logged => {
            let exit = cmd.cmd_result.as_ref().and_then(|r| r.exit_value);
            if exit == Some(0) {
                NodeStatus::Success
            } else {
                NodeStatus::Failure
            }
        }
        CmdStatus::Killed | CmdStatus::Exception | CmdStatus::Rejected => NodeStatus::Failure,
        CmdStatus::Stopped => NodeStatus::Stopped,
        CmdStatus::TimeoutKill => NodeStatus::Timeout,
        CmdStatus::Unknown => return Err(BadStatus(cmd.status)),
    };
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::{CmdKind, CmdResult};

    fn cmd_with(status: CmdStatus, exit: Option<i32>) -> Cmd {
        Cmd {
            id: "cmd-1".into(),
            kind: CmdKind::RunShell,
            status,
            session_id: None,
            cmd_result: exit.map(|e| CmdResult {
                exit_value: Some(e),
                ..Default::default()
            }),
            log_paths: Vec::new(),
            finished_date: None,
        }
    }

    #[test]
    fn test_pending_statuses() {
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Sent, None)).unwrap(),
            NodeStatus::Pending
        );
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Pending, None)).unwrap(),
            NodeStatus::Pending
        );
    }

    #[test]
    fn test_running_statuses() {
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Running, None)).unwrap(),
            NodeStatus::Running
        );
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Executed, None)).unwrap(),
            NodeStatus::Running
        );
    }

    #[test]
    fn test_logged_exit_code_decides() {
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Logged, Some(0))).unwrap(),
            NodeStatus::Success
        );
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Logged, Some(1))).unwrap(),
            NodeStatus::Failure
        );
        // no result at all counts as failure
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Logged, None)).unwrap(),
            NodeStatus::Failure
        );
    }

    #[test]
    fn test_failure_statuses() {
        for status in [CmdStatus::Killed, CmdStatus::Exception, CmdStatus::Rejected] {
            assert_eq!(
                map_status(&cmd_with(status, None)).unwrap(),
                NodeStatus::Failure
            );
        }
    }

    #[test]
    fn test_stop_and_timeout() {
        assert_eq!(
            map_status(&cmd_with(CmdStatus::Stopped, None)).unwrap(),
            NodeStatus::Stopped
        );
        assert_eq!(
            map_status(&cmd_with(CmdStatus::TimeoutKill, None)).unwrap(),
            NodeStatus::Timeout
        );
    }

    #[test]
    fn test_unknown_status_is_bad() {
        assert!(map_status(&cmd_with(CmdStatus::Unknown, None)).is_err());
    }
}
