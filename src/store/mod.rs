//! Persistence contracts consumed by the coordinator
//!
//! Jobs, node results and yml snapshots each get a small async trait; the
//! bundled [`MemoryStore`] keeps everything in concurrent maps. A database
//! implementation would slot in behind the same traits.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Job, NodeResult, NodeStatus, NodeTag};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Result not found for job {0}: {1}")]
    ResultNotFound(Uuid, String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: Job) -> Result<Job, StoreError>;
    async fn get(&self, id: Uuid) -> Option<Job>;
    async fn get_by_number(&self, flow_name: &str, number: u32) -> Option<Job>;
    async fn list(&self) -> Vec<Job>;
    async fn list_for_flow(&self, flow_name: &str) -> Vec<Job>;
    /// Latest job per flow name, skipping names that never ran.
    async fn list_latest(&self, flow_names: &[String]) -> Vec<Job>;
    async fn max_build_number(&self, flow_name: &str) -> u32;
    async fn update(&self, job: &Job) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Materialize the initial result set of a job in one shot.
    async fn create_many(&self, results: Vec<NodeResult>) -> Result<(), StoreError>;
    async fn find(&self, path: &str, job_id: Uuid) -> Option<NodeResult>;
    async fn update(&self, result: &NodeResult) -> Result<(), StoreError>;
    async fn list(&self, job_id: Uuid) -> Vec<NodeResult>;
    async fn find_by_status(
        &self,
        job_id: Uuid,
        status: NodeStatus,
        tag: NodeTag,
    ) -> Option<NodeResult>;
}

#[async_trait]
pub trait YmlStore: Send + Sync {
    async fn save_yml(&self, job_id: Uuid, text: &str) -> Result<(), StoreError>;
    async fn get_yml(&self, job_id: Uuid) -> Option<String>;
}

/// Everything the coordinator needs from persistence.
pub trait Store: JobStore + ResultStore + YmlStore {}
impl<T: JobStore + ResultStore + YmlStore> Store for T {}

/// In-memory store over concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: DashMap<Uuid, Job>,
    results: DashMap<(Uuid, String), NodeResult>,
    ymls: DashMap<Uuid, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save(&self, job: Job) -> Result<Job, StoreError> {
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    async fn get_by_number(&self, flow_name: &str, number: u32) -> Option<Job> {
        self.jobs
            .iter()
            .find(|j| j.node_name == flow_name && j.number == number)
            .map(|j| j.clone())
    }

    async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    async fn list_for_flow(&self, flow_name: &str) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.node_name == flow_name)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.number);
        jobs
    }

    async fn list_latest(&self, flow_names: &[String]) -> Vec<Job> {
        let mut latest: HashMap<&str, Job> = HashMap::new();
        for job in self.jobs.iter() {
            let Some(name) = flow_names.iter().find(|n| *n == &job.node_name) else {
                continue;
            };
            match latest.get(name.as_str()) {
                Some(existing) if existing.number >= job.number => {}
                _ => {
                    latest.insert(name.as_str(), job.clone());
                }
            }
        }
        flow_names
            .iter()
            .filter_map(|n| latest.remove(n.as_str()))
            .collect()
    }

    async fn max_build_number(&self, flow_name: &str) -> u32 {
        self.jobs
            .iter()
            .filter(|j| j.node_name == flow_name)
            .map(|j| j.number)
            .max()
            .unwrap_or(0)
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        match self.jobs.get_mut(&job.id) {
            Some(mut entry) => {
                *entry = job.clone();
                Ok(())
            }
            None => Err(StoreError::JobNotFound(job.id)),
        }
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_many(&self, results: Vec<NodeResult>) -> Result<(), StoreError> {
        for result in results {
            self.results
                .insert((result.job_id, result.path.clone()), result);
        }
        Ok(())
    }

    async fn find(&self, path: &str, job_id: Uuid) -> Option<NodeResult> {
        self.results
            .get(&(job_id, path.to_string()))
            .map(|r| r.clone())
    }

    async fn update(&self, result: &NodeResult) -> Result<(), StoreError> {
        let key = (result.job_id, result.path.clone());
        match self.results.get_mut(&key) {
            Some(mut entry) => {
                *entry = result.clone();
                Ok(())
            }
            None => Err(StoreError::ResultNotFound(result.job_id, result.path.clone())),
        }
    }

    async fn list(&self, job_id: Uuid) -> Vec<NodeResult> {
        let mut results: Vec<NodeResult> = self
            .results
            .iter()
            .filter(|r| r.job_id == job_id)
            .map(|r| r.clone())
            .collect();
        results.sort_by(|a, b| a.path.cmp(&b.path));
        results
    }

    async fn find_by_status(
        &self,
        job_id: Uuid,
        status: NodeStatus,
        tag: NodeTag,
    ) -> Option<NodeResult> {
        self.results
            .iter()
            .find(|r| r.job_id == job_id && r.status == status && r.tag == tag)
            .map(|r| r.clone())
    }
}

#[async_trait]
impl YmlStore for MemoryStore {
    async fn save_yml(&self, job_id: Uuid, text: &str) -> Result<(), StoreError> {
        self.ymls.insert(job_id, text.to_string());
        Ok(())
    }

    async fn get_yml(&self, job_id: Uuid) -> Option<String> {
        self.ymls.get(&job_id).map(|y| y.clone())
    }
}
