// In-memory doubles for the job store and the isolation worker

use crate::executor::JobExecutor;
use anyhow::{bail, Result};
use arbiter_common::store::{JobStore, StoreError};
use arbiter_common::types::{
    ExecutionReport, Job, JobRequest, JobResult, JobStatus, Language, TestCaseResult, Verdict,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

/// Records every status written per id and refuses illegal transitions
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<Vec<Job>>,
    results: Mutex<HashMap<String, JobResult>>,
    history: Mutex<HashMap<String, Vec<JobStatus>>>,
    pub fail_writes: AtomicBool,
    /// Number of upcoming `update_result` calls that fail
    pub failing_updates: AtomicUsize,
}

impl MemoryStore {
    pub fn seed(&self, job: Job, status: JobStatus) {
        let mut result = JobResult::queued(&job.id);
        result.status = status;
        self.history.lock().unwrap().insert(job.id.clone(), vec![status]);
        self.results.lock().unwrap().insert(job.id.clone(), result);
        self.jobs.lock().unwrap().push(job);
    }

    pub fn history(&self, id: &str) -> Vec<JobStatus> {
        self.history.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    pub fn all_results(&self) -> Vec<JobResult> {
        self.results.lock().unwrap().values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            let err = redis::RedisError::from((redis::ErrorKind::IoError, "store unavailable"));
            return Err(StoreError::Backend(err));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.check_available()?;
        self.seed(job.clone(), JobStatus::Queued);
        Ok(())
    }

    async fn update_result(&self, result: &JobResult) -> Result<(), StoreError> {
        self.check_available()?;
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            let err = redis::RedisError::from((redis::ErrorKind::IoError, "write dropped"));
            return Err(StoreError::Backend(err));
        }
        let mut results = self.results.lock().unwrap();
        let current = results
            .get(&result.id)
            .ok_or_else(|| StoreError::NotFound(result.id.clone()))?;
        assert!(
            current.status.can_transition_to(result.status),
            "illegal transition {} -> {}",
            current.status,
            result.status
        );
        results.insert(result.id.clone(), result.clone());
        self.history
            .lock()
            .unwrap()
            .entry(result.id.clone())
            .or_default()
            .push(result.status);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<JobResult, StoreError> {
        self.results
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn recoverable_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let results = self.results.lock().unwrap();
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|job| results.get(&job.id).is_some_and(|r| !r.status.is_terminal()))
            .cloned()
            .collect())
    }
}

/// Behavior is picked from the submitted code:
/// `ok`, `fail`, `panic`, or `block` (waits for `release`).
/// Every started job id is sent on the returned channel.
pub struct FakeExecutor {
    started: mpsc::UnboundedSender<String>,
    gate: Semaphore,
    in_flight: AtomicUsize,
    drained: AtomicBool,
}

/// Counts an execution until its future is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeExecutor {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let executor = FakeExecutor {
            started,
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
        };
        (Arc::new(executor), started_rx)
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    /// Executions whose futures are still alive
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for FakeExecutor {
    async fn execute(&self, job: &Job) -> Result<ExecutionReport> {
        let _running = InFlight::enter(&self.in_flight);
        let _ = self.started.send(job.id.clone());
        match job.code.as_str() {
            "ok" => Ok(accepted_report()),
            "fail" => bail!("container exploded"),
            "panic" => panic!("executor bug"),
            "block" => {
                let _permit = self.gate.acquire().await?;
                Ok(accepted_report())
            }
            other => bail!("unknown fake behavior {}", other),
        }
    }

    async fn drain(&self) {
        self.drained.store(true, Ordering::SeqCst);
    }
}

pub fn accepted_report() -> ExecutionReport {
    ExecutionReport {
        results: vec![TestCaseResult {
            id: "1".to_string(),
            status: Verdict::Accepted,
            time_ms: 1,
            message: None,
        }],
    }
}

pub fn request(code: &str) -> JobRequest {
    JobRequest {
        language: Language::Python,
        code: code.to_string(),
        bundle_path: PathBuf::from("/nonexistent"),
        time_limit_ms: 1000,
        memory_limit_mb: 64,
        callback_url: None,
    }
}
