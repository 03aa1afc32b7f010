/// Job Executor - Isolation Worker Orchestration
///
/// **Responsibility:**
/// Turn one job into one execution report.
///
/// **Architecture:**
/// 1. Build a private workspace from the job's bundle (workspace.rs)
/// 2. Write the source and derive the container launch spec
/// 3. Run the container through the isolation backend (engine.rs)
/// 4. Tear the workspace down whatever happened
///
/// The scheduler only sees the `JobExecutor` trait, so the pool can be
/// exercised without Docker.
use crate::engine::DockerEngine;
use crate::workspace::{ExecutionLimits, Workspace};
use anyhow::{Context, Result};
use arbiter_common::types::{ExecutionReport, Job};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: &Job) -> Result<ExecutionReport>;

    /// Wait for cleanup that cancelled executions left running in the background
    async fn drain(&self) {}
}

pub struct DockerExecutor {
    engine: DockerEngine,
    execution_root: PathBuf,
    runner_binary: PathBuf,
    container_timeout: Duration,
}

impl DockerExecutor {
    pub fn new(
        engine: DockerEngine,
        execution_root: PathBuf,
        runner_binary: PathBuf,
        container_timeout: Duration,
    ) -> Self {
        DockerExecutor {
            engine,
            execution_root,
            runner_binary,
            container_timeout,
        }
    }
}

#[async_trait]
impl JobExecutor for DockerExecutor {
    #[instrument(skip(self, job), fields(job_id = %job.id, language = %job.language))]
    async fn execute(&self, job: &Job) -> Result<ExecutionReport> {
        let bundle = job.bundle_path.clone();
        let root = self.execution_root.clone();
        let runner = self.runner_binary.clone();

        let mut workspace = tokio::task::spawn_blocking(move || {
            Workspace::prepare(&bundle, &root, &runner)
        })
        .await
        .context("Workspace preparation task failed")??;

        let limits = ExecutionLimits {
            test_timeout: Duration::from_millis(job.time_limit_ms),
            memory_limit_mb: job.memory_limit_mb,
        };

        // Drop removes the workspace if setup fails here
        let spec = workspace.setup_language(job.language, &job.code, &limits)?;

        let outcome = self
            .engine
            .execute(workspace.path(), &spec, self.container_timeout)
            .await;

        if let Err(e) = workspace.cleanup() {
            warn!(workspace = %workspace.path().display(), error = %e, "Failed to remove workspace");
        }

        let report = outcome.context("Sandboxed execution failed")?;

        info!(
            tests = report.results.len(),
            accepted = report.count(arbiter_common::types::Verdict::Accepted),
            "Execution report received"
        );

        Ok(report)
    }

    async fn drain(&self) {
        self.engine.drain_removals().await;
    }
}
