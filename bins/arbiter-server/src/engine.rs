/// Execution Engine - Docker Isolation Backend
///
/// **Core Responsibility:**
/// Run the in-container runner against a prepared workspace and hand back
/// the report it wrote.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to isolate (image, limits, mounts, outer deadline)
/// - Engine does NOT run test cases or judge output, the runner does
/// - Engine does NOT own the workspace, the executor does
///
/// **Failure Classes:**
/// - `ContainerTimeout`: the whole container outlived its deadline
/// - `MissingReport`: the container exited but left no readable report
/// - `Docker`: daemon or image problems
use crate::workspace::LaunchSpec;
use arbiter_common::protocol::{self, REPORT_FILE};
use arbiter_common::types::ExecutionReport;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Cap on each captured log stream attached to a missing-report error
const MAX_LOG_BYTES: usize = 4096;

/// How long a kill after the deadline may take before it is abandoned
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("container exceeded its {}s deadline", .0.as_secs())]
    ContainerTimeout(Duration),

    #[error("runner report unavailable ({reason}); stdout: {stdout:?}; stderr: {stderr:?}")]
    MissingReport {
        reason: String,
        stdout: String,
        stderr: String,
    },

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard<'a> {
    engine: &'a DockerEngine,
    /// Name or id, the daemon accepts either
    container: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(engine: &'a DockerEngine, container: String) -> Self {
        Self { engine, container }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Cannot await in Drop, removal runs as a task the engine can drain
        let container = self.container.clone();
        let docker = self.engine.docker.clone();

        let mut removals = self
            .engine
            .removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while removals.try_join_next().is_some() {}

        removals.spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            match docker.remove_container(&container, Some(remove_options)).await {
                Ok(()) => debug!(container = %container, "Container removed"),
                // Never created, the deadline or an error hit before create
                Err(e) if is_not_found(&e) => debug!(container = %container, "No container to remove"),
                Err(e) => warn!(container = %container, error = %e, "Failed to remove container"),
            }
        });
    }
}

/// Docker-based isolation backend
///
/// Every container gets:
/// - no network (`network_mode: none`)
/// - a hard memory ceiling with swap disabled
/// - a process count ceiling
/// - the job workspace bound read-write as its working directory
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    /// Removals spawned by dropped guards, drained on shutdown
    removals: Arc<Mutex<JoinSet<()>>>,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker))
    }

    fn with_client(docker: Docker) -> Self {
        DockerEngine {
            docker,
            removals: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Wait until every container removal started so far has finished
    pub async fn drain_removals(&self) {
        let mut pending = std::mem::take(
            &mut *self.removals.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if !pending.is_empty() {
            debug!(pending = pending.len(), "Waiting for container removals");
        }
        while pending.join_next().await.is_some() {}
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    /// Run one container over `workspace` and return the runner's report.
    ///
    /// `container_timeout` covers the whole life of the container: image
    /// pull, create, start and the run itself. The container is
    /// force-removed on every path, including when the caller's future is
    /// dropped mid-run.
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    pub async fn execute(
        &self,
        workspace: &Path,
        spec: &LaunchSpec,
        container_timeout: Duration,
    ) -> Result<ExecutionReport, EngineError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                network_mode: Some("none".to_string()),
                memory: Some(spec.memory_bytes),
                // Equal to memory: no swap on top of the ceiling
                memory_swap: Some(spec.memory_bytes),
                pids_limit: Some(spec.pids_limit),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("arbiter-{}", uuid::Uuid::new_v4().simple());

        // Guard by name before create, a create cut off by the deadline is still removed
        let _guard = ContainerGuard::new(self, container_name.clone());

        let start_time = Instant::now();

        let run = async {
            self.ensure_image(&spec.image).await?;

            let create_options = CreateContainerOptions {
                name: container_name.as_str(),
                platform: None,
            };
            self.docker
                .create_container(Some(create_options), config)
                .await?;

            self.docker
                .start_container(&container_name, None::<StartContainerOptions<String>>)
                .await?;
            let exit_code = self.wait_for_exit(&container_name).await?;
            Ok::<_, EngineError>(exit_code)
        };

        let exit_code = match tokio::time::timeout(container_timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    container = %container_name,
                    timeout_secs = container_timeout.as_secs(),
                    "Container deadline exceeded, killing"
                );
                let kill = self
                    .docker
                    .kill_container(&container_name, None::<KillContainerOptions<String>>);
                match tokio::time::timeout(KILL_TIMEOUT, kill).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(container = %container_name, error = %e, "Kill after timeout failed")
                    }
                    Err(_) => warn!(container = %container_name, "Kill after timeout hung"),
                }
                return Err(EngineError::ContainerTimeout(container_timeout));
            }
        };

        info!(
            container = %container_name,
            exit_code = ?exit_code,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Container exited"
        );

        match protocol::read_report(&workspace.join(REPORT_FILE)) {
            Ok(report) => Ok(report),
            Err(e) => {
                let (stdout, stderr) = self.collect_logs(&container_name).await;
                Err(EngineError::MissingReport {
                    reason: e.to_string(),
                    stdout,
                    stderr,
                })
            }
        }
    }

    /// Block until the container stops and return its exit code
    async fn wait_for_exit(&self, container: &str) -> Result<Option<i64>, EngineError> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait_stream = self.docker.wait_container(container, Some(wait_options));
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            // bollard reports a non-zero exit as an error, it is still a normal stop
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Collect whatever the container printed, for diagnostics
    async fn collect_logs(&self, container: &str) -> (String, String) {
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut logs_stream = self.docker.logs(container, logs_options);

        while let Some(output) = logs_stream.next().await {
            match output {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container = %container, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        (truncate_log(stdout), truncate_log(stderr))
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Keep the tail of a log, where the failure usually is
fn truncate_log(log: String) -> String {
    if log.len() <= MAX_LOG_BYTES {
        return log;
    }
    let mut start = log.len() - MAX_LOG_BYTES;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &log[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_log_keeps_short_logs() {
        assert_eq!(truncate_log("boom".to_string()), "boom");
    }

    #[test]
    fn test_truncate_log_keeps_tail_on_char_boundary() {
        let log = format!("{}{}", "é".repeat(MAX_LOG_BYTES), "Traceback: end");
        let truncated = truncate_log(log);

        assert!(truncated.starts_with("..."));
        assert!(truncated.ends_with("Traceback: end"));
        assert!(truncated.len() <= MAX_LOG_BYTES + 3);
    }

    #[test]
    fn test_not_found_detection() {
        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "removal in progress".to_string(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&conflict));
    }

    #[tokio::test]
    async fn test_deadline_covers_image_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        // Accepts every connection and never answers, like a wedged pull
        let daemon = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let docker =
            Docker::connect_with_socket(socket.to_str().unwrap(), 1, bollard::API_DEFAULT_VERSION)
                .unwrap();
        let engine = DockerEngine::with_client(docker);
        let spec = LaunchSpec {
            image: "python:3.12-slim".to_string(),
            cmd: vec!["./runner".to_string()],
            working_dir: "/app".to_string(),
            binds: Vec::new(),
            memory_bytes: 64 * 1024 * 1024,
            pids_limit: 64,
        };

        let started = Instant::now();
        let err = engine
            .execute(dir.path(), &spec, Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ContainerTimeout(_)), "got {}", err);
        assert!(started.elapsed() < Duration::from_secs(5));

        // The guard's removal is tracked until it gives up on the dead daemon
        assert_eq!(engine.removals.lock().unwrap().len(), 1);
        engine.drain_removals().await;
        assert!(engine.removals.lock().unwrap().is_empty());
        daemon.abort();
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::ContainerTimeout(Duration::from_secs(600));
        assert_eq!(err.to_string(), "container exceeded its 600s deadline");

        let err = EngineError::MissingReport {
            reason: "report file missing".to_string(),
            stdout: String::new(),
            stderr: "exec format error".to_string(),
        };
        assert!(err.to_string().contains("exec format error"));
    }
}
