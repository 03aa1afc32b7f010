/// Per-job Workspace
///
/// **Core Responsibility:**
/// Own the ephemeral directory a single job executes in:
/// test bundle + supervisor binary + submitted source.
///
/// **Lifecycle Guarantees:**
/// - Created fresh under the execution root with a unique `job-*` name
/// - Exclusively owned by one execution, never shared across jobs
/// - Removed on every exit path: explicit `cleanup()`, early `?` returns,
///   panics and task cancellation (the `TempDir` is removed on drop)
use anyhow::{Context, Result};
use arbiter_common::protocol::{RUNNER_FILE, WORKSPACE_MOUNT};
use arbiter_common::types::Language;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Prefix shared by every workspace directory, used to spot leftovers
pub const WORKSPACE_PREFIX: &str = "job-";

/// Container-side process ceiling, keeps fork bombs inside the sandbox
const PIDS_LIMIT: i64 = 64;

/// Limits a single job runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub test_timeout: Duration,
    pub memory_limit_mb: u64,
}

/// Everything the isolation backend needs to start the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// `host:container:mode` bind mounts
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub pids_limit: i64,
}

#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace holding the bundle and the supervisor.
    ///
    /// A failure after the directory exists removes it before returning.
    pub fn prepare(bundle: &Path, execution_root: &Path, runner_binary: &Path) -> Result<Self> {
        fs::create_dir_all(execution_root).with_context(|| {
            format!("Failed to create execution root {}", execution_root.display())
        })?;
        // Docker bind mounts need an absolute host path
        let root = fs::canonicalize(execution_root)
            .with_context(|| format!("Failed to resolve {}", execution_root.display()))?;

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&root)
            .context("Failed to create workspace directory")?;

        let workspace = Workspace {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        };

        copy_dir_recursive(bundle, &workspace.path)
            .with_context(|| format!("Failed to copy test bundle from {}", bundle.display()))?;

        install_runner(runner_binary, &workspace.path)?;

        debug!(workspace = %workspace.path.display(), "Workspace ready");
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the submission and describe how to launch it.
    ///
    /// The container gets no network, a hard memory ceiling with swap
    /// disabled, and the workspace as its read-write working directory.
    pub fn setup_language(
        &self,
        language: Language,
        source_code: &str,
        limits: &ExecutionLimits,
    ) -> Result<LaunchSpec> {
        let source_path = self.path.join(language.source_file());
        fs::write(&source_path, source_code)
            .with_context(|| format!("Failed to write source file {}", source_path.display()))?;

        let mut cmd = vec![
            format!("./{}", RUNNER_FILE),
            "--test-timeout-ms".to_string(),
            limits.test_timeout.as_millis().to_string(),
            "--".to_string(),
        ];
        cmd.extend(language.command());

        let memory_bytes = i64::try_from(limits.memory_limit_mb)
            .ok()
            .and_then(|mb| mb.checked_mul(1024 * 1024))
            .context("Memory limit out of range")?;

        Ok(LaunchSpec {
            image: language.image().to_string(),
            cmd,
            working_dir: WORKSPACE_MOUNT.to_string(),
            binds: vec![format!("{}:{}:rw", self.path.display(), WORKSPACE_MOUNT)],
            memory_bytes,
            pids_limit: PIDS_LIMIT,
        })
    }

    /// Remove the workspace directory. Safe to call more than once.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                debug!(workspace = %self.path.display(), "Removing workspace");
                dir.close()
            }
            None => Ok(()),
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if from.is_dir() {
            fs::create_dir_all(&to)?;
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn install_runner(runner_binary: &Path, workspace: &Path) -> Result<()> {
    let dest = workspace.join(RUNNER_FILE);
    fs::copy(runner_binary, &dest)
        .with_context(|| format!("Failed to read runner binary {}", runner_binary.display()))?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))
        .context("Failed to make runner executable")?;
    Ok(())
}

/// Delete workspaces a previous process left behind.
///
/// Only run at startup, before any worker owns a workspace.
pub fn purge_stale_workspaces(execution_root: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(execution_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if !entry.file_type()?.is_dir() || !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
            continue;
        }

        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(workspace = ?name, error = %e, "Failed to remove stale workspace"),
        }
    }

    if removed > 0 {
        info!(removed, "Removed stale workspaces");
    }
    Ok(removed)
}
