//! Command-control wire types
//!
//! Serde models for the JSON exchanged with the command-control service:
//! outbound [`CmdInfo`] requests and the [`Cmd`] descriptors it returns and
//! later POSTs back to our webhook.

pub mod gateway;

pub use gateway::{CommandGateway, GatewayError, HttpCommandGateway};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work dispatched to the command-control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdKind {
    CreateSession,
    DeleteSession,
    RunShell,
    /// Anything this orchestrator does not understand.
    #[serde(other)]
    Unknown,
}

/// Status reported by the command-control service for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdStatus {
    Pending,
    Sent,
    Running,
    Executed,
    Logged,
    Killed,
    Exception,
    Rejected,
    Stopped,
    TimeoutKill,
    #[serde(other)]
    Unknown,
}

/// Execution details attached to a command once it has produced any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdResult {
    #[serde(default)]
    pub exit_value: Option<i32>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: HashMap<String, String>,
}

/// A command descriptor as returned (and called back) by command-control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cmd {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CmdKind,
    pub status: CmdStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cmd_result: Option<CmdResult>,
    #[serde(default)]
    pub log_paths: Vec<String>,
    #[serde(default)]
    pub finished_date: Option<DateTime<Utc>>,
}

/// Outbound request body for the queue and cmd endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdInfo {
    pub zone: String,
    #[serde(rename = "type")]
    pub kind: CmdKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_env_filter: Option<String>,
}

impl CmdInfo {
    pub fn session(zone: &str, kind: CmdKind, session_id: Option<String>) -> Self {
        Self {
            zone: zone.to_string(),
            kind,
            webhook: None,
            session_id,
            script: None,
            inputs: HashMap::new(),
            output_env_filter: None,
        }
    }

    pub fn shell(zone: &str, session_id: &str, script: &str) -> Self {
        Self {
            zone: zone.to_string(),
            kind: CmdKind::RunShell,
            webhook: None,
            session_id: Some(session_id.to_string()),
            script: Some(script.to_string()),
            inputs: HashMap::new(),
            output_env_filter: None,
        }
    }
}

/// Webhook identifier of a step callback: which job and which node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepIdentifier {
    #[serde(rename = "jobId")]
    pub job_id: uuid::Uuid,
    pub path: String,
}

/// Percent-encode a query string value (spaces → %20, etc.).
///
/// Only encodes characters that must be encoded in a query parameter value.
pub fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(ch),
            ' ' => out.push_str("%20"),
            _ => {
                for byte in ch.to_string().as_bytes() {
                    out.push_str(&format!("%{:02X}", byte));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&CmdKind::CreateSession).unwrap(),
            "\"CREATE_SESSION\""
        );
        assert_eq!(
            serde_json::from_str::<CmdKind>("\"RUN_SHELL\"").unwrap(),
            CmdKind::RunShell
        );
        // unknown kinds deserialize instead of failing the whole callback
        assert_eq!(
            serde_json::from_str::<CmdKind>("\"SHUTDOWN\"").unwrap(),
            CmdKind::Unknown
        );
    }

    #[test]
    fn test_cmd_status_wire_names() {
        assert_eq!(
            serde_json::from_str::<CmdStatus>("\"TIMEOUT_KILL\"").unwrap(),
            CmdStatus::TimeoutKill
        );
        assert_eq!(
            serde_json::from_str::<CmdStatus>("\"SOMETHING_NEW\"").unwrap(),
            CmdStatus::Unknown
        );
    }

    #[test]
    fn test_cmd_deserialization() {
        let json = r#"{
            "id": "cmd-1",
            "type": "RUN_SHELL",
            "status": "LOGGED",
            "sessionId": "session-9",
            "cmdResult": {"exitValue": 0, "output": {"FLOW_OUT": "1"}},
            "logPaths": ["/logs/cmd-1.log"]
        }"#;
        let cmd: Cmd = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.id, "cmd-1");
        assert_eq!(cmd.status, CmdStatus::Logged);
        assert_eq!(cmd.cmd_result.unwrap().exit_value, Some(0));
        assert_eq!(cmd.log_paths.len(), 1);
    }

    #[test]
    fn test_cmd_info_serialization_skips_empty() {
        let info = CmdInfo::session("default", CmdKind::CreateSession, None);
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("CREATE_SESSION"));
        assert!(!json.contains("script"));
        assert!(!json.contains("sessionId"));
        assert!(!json.contains("inputs"));
    }

    #[test]
    fn test_step_identifier_roundtrip() {
        let id = StepIdentifier {
            job_id: uuid::Uuid::new_v4(),
            path: "demo/build".into(),
        };
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains("jobId"));
        let back: StepIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, "demo/build");
        assert_eq!(back.job_id, id.job_id);
    }

    #[test]
    fn test_urlencoded() {
        assert_eq!(urlencoded("abc-123_~.z"), "abc-123_~.z");
        assert_eq!(urlencoded("a b"), "a%20b");
        assert_eq!(
            urlencoded(r#"{"jobId":"1"}"#),
            "%7B%22jobId%22%3A%221%22%7D"
        );
    }
}
