use crate::types::{Job, JobResult};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable job records.
///
/// Implementations must make a single record write atomic and keep records
/// across process restarts. Writers are serialized per id by the scheduler,
/// so no cross-record locking is expected.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job with status Queued
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Overwrite the result record of an existing job
    async fn update_result(&self, result: &JobResult) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<JobResult, StoreError>;

    /// Jobs still Queued or Processing, in creation order.
    /// Records that fail to decode are skipped.
    async fn recoverable_jobs(&self) -> Result<Vec<Job>, StoreError>;
}
