// Test case orchestration inside the container

use crate::evaluator::{evaluate_test, ProcessOutcome, TestExecutionOutput};
use arbiter_common::protocol::{INPUT_EXTENSION, OUTPUT_EXTENSION};
use arbiter_common::types::{ExecutionReport, TestCaseResult, Verdict};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// An input file and the expected output that goes with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPair {
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// Find every `<id>.in` in `dir`, ordered by filename.
///
/// The matching `<id>.out` is not required to exist; a missing one is
/// reported per test as IER.
pub fn discover_tests(dir: &Path) -> io::Result<Vec<TestPair>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        names.push(entry.file_name());
    }
    names.sort();

    let tests = names
        .into_iter()
        .filter_map(|name| {
            let path = PathBuf::from(&name);
            if path.extension()? != INPUT_EXTENSION {
                return None;
            }
            let id = path.file_stem()?.to_string_lossy().into_owned();
            Some(TestPair {
                input_path: dir.join(&name),
                output_path: dir.join(format!("{}.{}", id, OUTPUT_EXTENSION)),
                id,
            })
        })
        .collect();

    Ok(tests)
}

/// Per-stream cap on captured output
pub const DEFAULT_OUTPUT_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Limits applied to every test case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestLimits {
    pub timeout: Duration,
    /// Applies to stdout and stderr separately
    pub output_limit_bytes: u64,
}

enum CaptureError {
    OutputLimit,
    Io(io::Error),
}

impl From<io::Error> for CaptureError {
    fn from(e: io::Error) -> Self {
        CaptureError::Io(e)
    }
}

/// Run the submission once against `pair` and classify the outcome.
///
/// The child gets stdin from the `.in` file and runs in its own process
/// group. The group is killed once the test is over, so nothing the
/// submission forked outlives it. Elapsed time is recorded whatever happens.
pub async fn run_test_case(
    pair: &TestPair,
    command: &[String],
    limits: &TestLimits,
    workdir: &Path,
) -> TestCaseResult {
    let input = match File::open(&pair.input_path) {
        Ok(file) => file,
        Err(e) => {
            return TestCaseResult {
                id: pair.id.clone(),
                status: Verdict::InternalError,
                time_ms: 0,
                message: Some(format!("Failed to open input: {}", e)),
            };
        }
    };

    let Some((program, args)) = command.split_first() else {
        return TestCaseResult {
            id: pair.id.clone(),
            status: Verdict::InternalError,
            time_ms: 0,
            message: Some("No command to execute".to_string()),
        };
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::from(input))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let start = Instant::now();

    let (outcome, stdout, stderr, execution_time_ms) = match cmd.spawn() {
        Err(e) => (
            ProcessOutcome::SpawnFailed(e.to_string()),
            String::new(),
            String::new(),
            start.elapsed().as_millis() as u64,
        ),
        Ok(child) => supervise(child, limits, start).await,
    };

    let expected = match tokio::fs::read(&pair.output_path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            debug!(test_id = %pair.id, error = %e, "Expected output unavailable");
            None
        }
    };

    let output = TestExecutionOutput {
        test_id: pair.id.clone(),
        outcome,
        stdout,
        stderr,
        execution_time_ms,
    };

    evaluate_test(&output, expected.as_deref())
}

/// Wait for `child` under the wall-clock limit while draining both pipes
/// through capped readers, then kill whatever is left of its group.
async fn supervise(
    mut child: Child,
    limits: &TestLimits,
    start: Instant,
) -> (ProcessOutcome, String, String, u64) {
    let pgid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let limit = limits.output_limit_bytes;

    let run = async {
        let (stdout, stderr) =
            tokio::try_join!(read_capped(stdout, limit), read_capped(stderr, limit))?;
        let status = child.wait().await?;
        Ok::<_, CaptureError>((status, stdout, stderr))
    };
    let finished = tokio::time::timeout(limits.timeout, run).await;
    let execution_time_ms = start.elapsed().as_millis() as u64;

    if let Some(pgid) = pgid {
        kill_process_group(pgid);
    }
    let _ = child.start_kill();
    let _ = child.wait().await;

    let (outcome, stdout, stderr) = match finished {
        Ok(Ok((status, stdout, stderr))) => (
            ProcessOutcome::Exited {
                code: status.code(),
            },
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ),
        Ok(Err(CaptureError::OutputLimit)) => (
            ProcessOutcome::OutputLimitExceeded { limit_bytes: limit },
            String::new(),
            String::new(),
        ),
        Ok(Err(CaptureError::Io(e))) => (
            ProcessOutcome::SpawnFailed(format!("Failed to wait for process: {}", e)),
            String::new(),
            String::new(),
        ),
        Err(_) => (ProcessOutcome::TimedOut, String::new(), String::new()),
    };

    (outcome, stdout, stderr, execution_time_ms)
}

/// Read `stream` to EOF, giving up as soon as it passes `limit` bytes
async fn read_capped<R>(stream: Option<R>, limit: u64) -> Result<Vec<u8>, CaptureError>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(Vec::new());
    };

    let mut buf = Vec::new();
    stream.take(limit.saturating_add(1)).read_to_end(&mut buf).await?;
    if buf.len() as u64 > limit {
        return Err(CaptureError::OutputLimit);
    }
    Ok(buf)
}

fn kill_process_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };

    // SAFETY: kill(2) takes plain integers and touches no memory of ours
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // ESRCH: the whole group is already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "Failed to kill process group");
        }
    }
}

/// Run every discovered test in order, one at a time
pub async fn run_all(
    tests: &[TestPair],
    command: &[String],
    limits: &TestLimits,
    workdir: &Path,
) -> ExecutionReport {
    let mut results = Vec::with_capacity(tests.len());

    for pair in tests {
        let result = run_test_case(pair, command, limits, workdir).await;

        if result.status == Verdict::Accepted {
            debug!(test_id = %result.id, time_ms = result.time_ms, "Test passed");
        } else {
            warn!(
                test_id = %result.id,
                status = %result.status,
                time_ms = result.time_ms,
                "Test did not pass"
            );
        }

        results.push(result);
    }

    info!(
        total = results.len(),
        accepted = results.iter().filter(|r| r.status == Verdict::Accepted).count(),
        "All test cases executed"
    );

    ExecutionReport { results }
}

/// Stand-in report when the test directory itself cannot be read
pub fn discovery_failure_report(error: &io::Error) -> ExecutionReport {
    ExecutionReport {
        results: vec![TestCaseResult {
            id: "0".to_string(),
            status: Verdict::InternalError,
            time_ms: 0,
            message: Some(format!("Failed to discover tests: {}", error)),
        }],
    }
}
