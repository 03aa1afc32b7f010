use crate::store::{JobStore, StoreError};
use crate::types::{Job, JobResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

/// Redis key layout - keeps server restarts and external tooling in agreement
/// about where records live.
///
/// - `arbiter:job:<id>`     job spec, written once
/// - `arbiter:result:<id>`  latest JobResult, overwritten per transition
/// - `arbiter:recoverable`  sorted set of non-terminal ids scored by creation time

pub const JOB_PREFIX: &str = "arbiter:job";
pub const RESULT_PREFIX: &str = "arbiter:result";
pub const RECOVERABLE_KEY: &str = "arbiter:recoverable";

/// Generate job spec key for a job
pub fn job_key(job_id: &str) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Generate result key for a job
pub fn result_key(job_id: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

/// Job-record store backed by Redis.
///
/// Durability follows the server's persistence settings (AOF/RDB); every
/// write for one job goes through a MULTI/EXEC pipeline so the spec, the
/// result and the recoverable index never disagree.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let job_payload = serde_json::to_string(job)?;
        let result_payload = serde_json::to_string(&JobResult::queued(&job.id))?;
        let created_at = chrono::Utc::now().timestamp_millis();

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(job_key(&job.id), job_payload)
            .ignore()
            .set(result_key(&job.id), result_payload)
            .ignore()
            .zadd(RECOVERABLE_KEY, job.id.as_str(), created_at)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn update_result(&self, result: &JobResult) -> Result<(), StoreError> {
        let payload = serde_json::to_string(result)?;

        let mut pipe = redis::pipe();
        pipe.atomic().set(result_key(&result.id), payload).ignore();
        if result.status.is_terminal() {
            pipe.zrem(RECOVERABLE_KEY, result.id.as_str()).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<JobResult, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(result_key(id)).await?;

        match payload {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn recoverable_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(RECOVERABLE_KEY, 0, -1).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let payload: Option<String> = conn.get(job_key(&id)).await?;
            match payload {
                Some(data) => match serde_json::from_str::<Job>(&data) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Skipping corrupted job record");
                    }
                },
                None => {
                    warn!(job_id = %id, "Recoverable index points at a missing job record");
                }
            }
        }

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionReport, JobStatus, Language};
    use std::path::PathBuf;

    #[test]
    fn test_job_key_format() {
        assert_eq!(job_key("abc123"), "arbiter:job:abc123");
    }

    #[test]
    fn test_result_key_deterministic() {
        let key1 = result_key("deadbeef");
        let key2 = result_key("deadbeef");
        assert_eq!(key1, key2);
        assert!(key1.starts_with("arbiter:result:"));
        assert!(key1.ends_with("deadbeef"));
    }

    fn make_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            language: Language::Python,
            code: "print(input())".to_string(),
            bundle_path: PathBuf::from("/tmp/bundle"),
            time_limit_ms: 1000,
            memory_limit_mb: 128,
            callback_url: None,
        }
    }

    /// Round trip through a live Redis instance
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_store_lifecycle() {
        let store = RedisJobStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        let id = format!("test-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let job = make_job(&id);

        store.create_job(&job).await.unwrap();
        assert_eq!(store.get_by_id(&id).await.unwrap().status, JobStatus::Queued);
        assert!(store.recoverable_jobs().await.unwrap().iter().any(|j| j.id == id));

        store
            .update_result(&JobResult::success(&id, ExecutionReport::default()))
            .await
            .unwrap();
        assert_eq!(store.get_by_id(&id).await.unwrap().status, JobStatus::Success);
        assert!(!store.recoverable_jobs().await.unwrap().iter().any(|j| j.id == id));

        assert!(matches!(
            store.get_by_id("definitely-missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
