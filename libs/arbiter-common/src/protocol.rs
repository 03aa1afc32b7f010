//! Contract between the host and the runner inside the container.
//!
//! The host bind-mounts the workspace at [`WORKSPACE_MOUNT`], starts
//! [`RUNNER_FILE`] there, and after the container exits reads
//! [`REPORT_FILE`] back from the same directory.

use crate::types::ExecutionReport;
use std::fs;
use std::io;
use std::path::Path;

/// Where the workspace is mounted inside the container
pub const WORKSPACE_MOUNT: &str = "/app";

/// Filename of the injected supervisor binary
pub const RUNNER_FILE: &str = "runner";

/// Report the supervisor leaves behind in the workspace
pub const REPORT_FILE: &str = "result.json";

pub const INPUT_EXTENSION: &str = "in";
pub const OUTPUT_EXTENSION: &str = "out";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report file not found or unreadable: {0}")]
    Missing(#[source] io::Error),
    #[error("report file is not valid JSON: {0}")]
    Corrupt(#[source] serde_json::Error),
}

pub fn write_report(path: &Path, report: &ExecutionReport) -> io::Result<()> {
    let content = serde_json::to_vec_pretty(report)?;
    fs::write(path, content)
}

pub fn read_report(path: &Path) -> Result<ExecutionReport, ReportError> {
    let content = fs::read(path).map_err(ReportError::Missing)?;
    serde_json::from_slice(&content).map_err(ReportError::Corrupt)
}
