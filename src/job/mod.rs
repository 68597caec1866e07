//! Job domain model
//!
//! A [`Job`] is one execution of a flow; a [`NodeResult`] is the runtime
//! state of one tree node within one job. Results only ever move up the
//! status ladder, which is what makes duplicated and reordered callbacks
//! harmless.

pub mod status;

pub use status::{map_status, BadStatus};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node status ladder. Total order via [`NodeStatus::level`]; the four
/// terminal states share the top level and absorb further updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Enqueue,
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Stopped,
}

impl NodeStatus {
    pub fn level(&self) -> u8 {
        match self {
            NodeStatus::Enqueue => 0,
            NodeStatus::Pending => 1,
            NodeStatus::Running => 2,
            NodeStatus::Success
            | NodeStatus::Failure
            | NodeStatus::Timeout
            | NodeStatus::Stopped => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.level() == 3
    }
}

/// Where a result's node sits in the tree: the flow root, an inner group,
/// or a leaf step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeTag {
    Flow,
    Group,
    Step,
}

/// One execution of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Root path of the flow this job runs.
    pub node_path: String,
    /// Flow display name (equals the root path for top-level flows).
    pub node_name: String,
    /// Build number, strictly increasing per flow name.
    pub number: u32,
    /// Env snapshot copied from the flow root at creation.
    pub envs: HashMap<String, String>,
    /// Session reserved on command-control, set by the SENT callback.
    pub session_id: Option<String>,
    /// Cmd id of the CREATE_SESSION command, used to stop a not-yet-running job.
    pub cmd_id: Option<String>,
    /// Set once DELETE_SESSION has been enqueued.
    pub session_released: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(node_path: &str, node_name: &str, number: u32, envs: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            node_path: node_path.to_string(),
            node_name: node_name.to_string(),
            number,
            envs,
            session_id: None,
            cmd_id: None,
            session_released: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Runtime state of one node within one job, keyed `(job id, node path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub job_id: Uuid,
    pub path: String,
    pub tag: NodeTag,
    pub status: NodeStatus,
    /// Cmd id of the last command dispatched for this node.
    pub cmd_id: Option<String>,
    pub exit_code: Option<i32>,
    pub log_paths: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    /// Seconds between start and finish.
    pub duration: Option<i64>,
    /// Output env merged up from the node's commands.
    pub outputs: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl NodeResult {
    pub fn new(job_id: Uuid, path: &str, tag: NodeTag) -> Self {
        Self {
            job_id,
            path: path.to_string(),
            tag,
            status: NodeStatus::Enqueue,
            cmd_id: None,
            exit_code: None,
            log_paths: Vec::new(),
            start_time: None,
            finish_time: None,
            duration: None,
            outputs: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Move up the ladder. Returns `false` (and leaves the result untouched)
    /// when the update would be a downward or sideways move.
    pub fn raise(&mut self, status: NodeStatus) -> bool {
        if self.status.level() >= status.level() {
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }

    /// Recompute duration once both endpoints are known.
    pub fn refresh_duration(&mut self) {
        if let (Some(start), Some(finish)) = (self.start_time, self.finish_time) {
            self.duration = Some(finish.timestamp() - start.timestamp());
        }
    }
}

/// Merge `source` into `target`. Existing keys survive unless `overwrite`.
pub fn merge_envs(
    target: &mut HashMap<String, String>,
    source: &HashMap<String, String>,
    overwrite: bool,
) {
    for (k, v) in source {
        if overwrite || !target.contains_key(k) {
            target.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_levels() {
        assert!(NodeStatus::Enqueue.level() < NodeStatus::Pending.level());
        assert!(NodeStatus::Pending.level() < NodeStatus::Running.level());
        assert!(NodeStatus::Running.level() < NodeStatus::Success.level());
        assert_eq!(NodeStatus::Success.level(), NodeStatus::Failure.level());
        assert_eq!(NodeStatus::Timeout.level(), NodeStatus::Stopped.level());
    }

    #[test]
    fn test_raise_is_monotonic() {
        let mut result = NodeResult::new(Uuid::new_v4(), "demo/build", NodeTag::Step);
        assert!(result.raise(NodeStatus::Running));
        // downward move dropped
        assert!(!result.raise(NodeStatus::Pending));
        assert_eq!(result.status, NodeStatus::Running);
        // terminal absorbs later terminals
        assert!(result.raise(NodeStatus::Success));
        assert!(!result.raise(NodeStatus::Failure));
        assert_eq!(result.status, NodeStatus::Success);
    }

    #[test]
    fn test_raise_same_level_is_noop() {
        let mut result = NodeResult::new(Uuid::new_v4(), "demo/build", NodeTag::Step);
        result.raise(NodeStatus::Running);
        assert!(!result.raise(NodeStatus::Running));
    }

    #[test]
    fn test_refresh_duration() {
        let mut result = NodeResult::new(Uuid::new_v4(), "demo/build", NodeTag::Step);
        result.start_time = Some("2026-01-01T00:00:00Z".parse().unwrap());
        result.finish_time = Some("2026-01-01T00:00:42Z".parse().unwrap());
        result.refresh_duration();
        assert_eq!(result.duration, Some(42));
    }

    #[test]
    fn test_merge_envs_keep_existing() {
        let mut target = HashMap::from([("A".to_string(), "1".to_string())]);
        let source = HashMap::from([
            ("A".to_string(), "2".to_string()),
            ("B".to_string(), "3".to_string()),
        ]);
        merge_envs(&mut target, &source, false);
        assert_eq!(target["A"], "1");
        assert_eq!(target["B"], "3");
    }

    #[test]
    fn test_merge_envs_overwrite() {
        let mut target = HashMap::from([("A".to_string(), "1".to_string())]);
        let source = HashMap::from([("A".to_string(), "2".to_string())]);
        merge_envs(&mut target, &source, true);
        assert_eq!(target["A"], "2");
    }

    #[test]
    fn test_job_new_snapshot() {
        let envs = HashMap::from([("FLOW_STATUS".to_string(), "READY".to_string())]);
        let job = Job::new("demo", "demo", 3, envs);
        assert_eq!(job.number, 3);
        assert!(job.session_id.is_none());
        assert!(!job.session_released);
    }
}
