/// Job Scheduler - Bounded Worker Pool
///
/// **Core Responsibility:**
/// Admit jobs, run them on a fixed number of workers, and keep the job
/// record in the store current at every step.
///
/// **Admission Control:**
/// - One bounded queue, `enqueue` never waits for room
/// - A full queue rejects the job at once and records it as Error
/// - The id is only handed out for jobs that actually made it into the queue
///
/// **Per-Job Write Order:**
/// Queued -> Processing -> Success | Error, single writer per id.
/// Per-test verdicts live inside a Success report; only infrastructure
/// failures make a job Error.
///
/// **Restart Behavior:**
/// Queued and Processing records are re-enqueued at start. Anything that
/// does not fit is left in the store for the next start.
///
/// **Shutdown:**
/// Workers stop taking jobs, running executions are cancelled and awaited
/// until dropped, then the executor drains its own background cleanup.
/// Cancelled jobs stay Processing and are recovered on the next start.
use crate::callback::CallbackNotifier;
use crate::executor::JobExecutor;
use arbiter_common::store::{JobStore, StoreError};
use arbiter_common::types::{Job, JobRequest, JobResult, JobStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const QUEUE_FULL_MESSAGE: &str = "queue full";

/// Attempts at marking a rejected job as Error
const REJECTION_WRITE_ATTEMPTS: u32 = 3;
const REJECTION_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_size: usize,
    /// Used when a job carries no callback URL of its own
    pub default_callback_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job queue is full")]
    QueueFull,
    #[error("failed to persist job: {0}")]
    Persistence(#[from] StoreError),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

struct Shared<S, E> {
    store: Arc<S>,
    executor: Arc<E>,
    callbacks: CallbackNotifier,
    default_callback_url: Option<String>,
}

pub struct Scheduler<S, E> {
    shared: Arc<Shared<S, E>>,
    sender: mpsc::Sender<Job>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: JobStore, E: JobExecutor> Scheduler<S, E> {
    /// Spawn the worker pool, then re-enqueue whatever the store says
    /// was still pending when the previous process stopped.
    pub async fn start(store: Arc<S>, executor: Arc<E>, config: SchedulerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (stop, stop_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            store,
            executor,
            callbacks: CallbackNotifier::new(),
            default_callback_url: config.default_callback_url,
        });

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&shared),
                    Arc::clone(&receiver),
                    stop_rx.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.workers,
            queue_size = config.queue_size,
            "Scheduler started"
        );

        let scheduler = Scheduler {
            shared,
            sender,
            stop,
            workers: Mutex::new(workers),
        };
        scheduler.recover().await;
        scheduler
    }

    /// Persist and queue a new job, returning its id.
    pub async fn enqueue(&self, request: JobRequest) -> Result<String, SchedulerError> {
        let id = Uuid::new_v4().simple().to_string();
        let job = Job::from_request(id.clone(), request);

        self.shared.store.create_job(&job).await?;

        match self.sender.try_send(job) {
            Ok(()) => {
                info!(job_id = %id, "Job queued");
                Ok(id)
            }
            Err(TrySendError::Full(job)) => {
                warn!(job_id = %job.id, "Queue full, rejecting job");
                self.record_rejection(&JobResult::error(&job.id, QUEUE_FULL_MESSAGE))
                    .await;
                Err(SchedulerError::QueueFull)
            }
            Err(TrySendError::Closed(job)) => {
                warn!(job_id = %job.id, "Workers stopped, rejecting job");
                self.record_rejection(&JobResult::error(&job.id, "scheduler shutting down"))
                    .await;
                Err(SchedulerError::ShuttingDown)
            }
        }
    }

    pub async fn get_result(&self, id: &str) -> Result<JobResult, StoreError> {
        self.shared.store.get_by_id(id).await
    }

    /// Mark a job that was created but never queued as Error.
    ///
    /// The record was written Queued, so until this lands the job sits in
    /// the recovery index and would run after a restart.
    async fn record_rejection(&self, result: &JobResult) {
        for attempt in 1..=REJECTION_WRITE_ATTEMPTS {
            match self.shared.store.update_result(result).await {
                Ok(()) => return,
                Err(e) if attempt < REJECTION_WRITE_ATTEMPTS => {
                    warn!(job_id = %result.id, attempt, error = %e, "Failed to record rejection, retrying");
                    tokio::time::sleep(REJECTION_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        job_id = %result.id,
                        error = %e,
                        "Rejected job is still recorded Queued, it will run after a restart"
                    );
                }
            }
        }
    }

    /// Stop the workers and wait for them to finish.
    ///
    /// Executions still running are cancelled and left Processing, so the
    /// next `start` picks them up again.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);

        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }

        self.shared.executor.drain().await;
        info!("Scheduler stopped");
    }

    async fn recover(&self) -> usize {
        let jobs = match self.shared.store.recoverable_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load recoverable jobs");
                return 0;
            }
        };

        if jobs.is_empty() {
            return 0;
        }

        let total = jobs.len();
        let mut requeued = 0;
        for job in jobs {
            let job_id = job.id.clone();
            match self.sender.try_send(job) {
                Ok(()) => requeued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(job_id = %job_id, "Queue full during recovery, job left for next start");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }

        info!(recovered = requeued, pending = total, "Recovered unfinished jobs");
        requeued
    }
}

#[instrument(skip(shared, receiver, stop))]
async fn worker_loop<S: JobStore, E: JobExecutor>(
    worker_id: usize,
    shared: Arc<Shared<S, E>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("Worker ready");

    loop {
        let job = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            job = next_job(&receiver) => job,
        };

        match job {
            Some(job) => process(&shared, job, &mut stop).await,
            None => break,
        }
    }

    debug!("Worker exiting");
}

async fn next_job(receiver: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    receiver.lock().await.recv().await
}

/// Resolves once shutdown is requested or the scheduler is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopping| *stopping).await;
}

#[instrument(skip(shared, job, stop), fields(job_id = %job.id, language = %job.language))]
async fn process<S: JobStore, E: JobExecutor>(
    shared: &Shared<S, E>,
    job: Job,
    stop: &mut watch::Receiver<bool>,
) {
    persist(&*shared.store, &JobResult::processing(&job.id)).await;

    let start = Instant::now();
    let executor = Arc::clone(&shared.executor);
    let task_job = job.clone();

    // A panic inside the executor surfaces as a JoinError, not a dead worker
    let mut execution = tokio::spawn(async move { executor.execute(&task_job).await });

    let outcome = tokio::select! {
        outcome = &mut execution => outcome,
        _ = stopped(stop) => {
            execution.abort();
            // Resolves only after the execution future and its guards are dropped
            let _ = execution.await;
            warn!("Execution cancelled by shutdown, job left for recovery");
            return;
        }
    };

    let result = match outcome {
        Ok(Ok(report)) => JobResult::success(&job.id, report),
        Ok(Err(e)) => {
            error!(error = %format!("{:#}", e), "Job execution failed");
            JobResult::error(&job.id, format!("{:#}", e))
        }
        Err(e) => {
            error!(error = %e, "Job execution task failed");
            JobResult::error(&job.id, format!("execution task failed: {}", e))
        }
    };

    info!(
        status = %result.status,
        tests = result.result.results.len(),
        execution_ms = start.elapsed().as_millis() as u64,
        "Job finished"
    );

    persist(&*shared.store, &result).await;

    if result.status == JobStatus::Success {
        let url = job
            .callback_url
            .clone()
            .or_else(|| shared.default_callback_url.clone());
        if let Some(url) = url {
            shared.callbacks.notify(url, result);
        }
    }
}

/// Write a status update, logging instead of failing
async fn persist<S: JobStore>(store: &S, result: &JobResult) {
    if let Err(e) = store.update_result(result).await {
        error!(job_id = %result.id, status = %result.status, error = %e, "Failed to persist job status");
    }
}
