mod evaluator;
mod supervisor;

use anyhow::{Context, Result};
use arbiter_common::protocol::{self, REPORT_FILE};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Runs a submission against every `<id>.in`/`<id>.out` pair in a directory
/// and writes the verdicts as JSON.
#[derive(Parser, Debug)]
#[command(name = "runner")]
#[command(about = "Arbiter in-container test supervisor", long_about = None)]
struct Cli {
    /// Directory holding the test pairs and the submission
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Wall-clock limit for a single test case, in milliseconds
    #[arg(long, default_value_t = 2000)]
    test_timeout_ms: u64,

    /// Cap on stdout and on stderr for a single test case, in bytes
    #[arg(long, default_value_t = supervisor::DEFAULT_OUTPUT_LIMIT_BYTES)]
    output_limit_bytes: u64,

    /// Report file, relative paths resolve against --dir
    #[arg(long, default_value = REPORT_FILE)]
    report: PathBuf,

    /// Command that runs the submission, e.g. `-- python3 source.py`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logs go to stderr, the host collects them from the container log stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let report_path = cli.dir.join(&cli.report);
    let limits = supervisor::TestLimits {
        timeout: Duration::from_millis(cli.test_timeout_ms),
        output_limit_bytes: cli.output_limit_bytes,
    };

    info!(
        dir = %cli.dir.display(),
        timeout_ms = cli.test_timeout_ms,
        output_limit_bytes = cli.output_limit_bytes,
        command = ?cli.command,
        "Runner starting"
    );

    let tests = match supervisor::discover_tests(&cli.dir) {
        Ok(tests) => tests,
        Err(e) => {
            error!(error = %e, "Failed to discover tests");
            let report = supervisor::discovery_failure_report(&e);
            if let Err(write_err) = protocol::write_report(&report_path, &report) {
                error!(error = %write_err, "Failed to write report");
            }
            std::process::exit(1);
        }
    };

    info!(test_count = tests.len(), "Discovered test cases");

    let report = supervisor::run_all(&tests, &cli.command, &limits, &cli.dir).await;

    protocol::write_report(&report_path, &report)
        .with_context(|| format!("Failed to write report to {}", report_path.display()))?;

    info!(report = %report_path.display(), "Report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_host_invocation() {
        let cli = Cli::try_parse_from([
            "runner",
            "--test-timeout-ms",
            "1500",
            "--",
            "python3",
            "-u",
            "source.py",
        ])
        .unwrap();

        assert_eq!(cli.test_timeout_ms, 1500);
        assert_eq!(cli.output_limit_bytes, supervisor::DEFAULT_OUTPUT_LIMIT_BYTES);
        assert_eq!(cli.dir, PathBuf::from("."));
        assert_eq!(cli.report, PathBuf::from(REPORT_FILE));
        assert_eq!(cli.command, vec!["python3", "-u", "source.py"]);
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["runner", "--test-timeout-ms", "10"]).is_err());
    }
}
