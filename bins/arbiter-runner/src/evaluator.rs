/// Test Evaluator - Verdict Classification
///
/// **Core Responsibility:**
/// Turn one raw process outcome plus the expected output into a verdict.
///
/// **Classification Order (first match wins):**
/// 1. Timed out                         -> TLE
/// 2. Output over the cap               -> RTE
/// 3. Non-zero exit or spawn failure    -> RTE (message = truncated stderr)
/// 4. Expected output missing           -> IER
/// 5. Normalized outputs equal          -> AC
/// 6. Otherwise                         -> WA (message = lengths only)
///
/// **Normalization Rules:**
/// - CRLF becomes LF (any run of CR directly before LF is dropped)
/// - Trailing whitespace is trimmed
/// - Leading whitespace, internal whitespace and case are preserved
use arbiter_common::types::{TestCaseResult, Verdict};

/// Diagnostic messages are cut to this many characters
pub const MAX_MESSAGE_CHARS: usize = 1000;
pub const TRUNCATION_SUFFIX: &str = "...(truncated)";

/// How the submission process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Killed after the per-test deadline
    TimedOut,
    /// Killed after stdout or stderr passed the capture cap
    OutputLimitExceeded { limit_bytes: u64 },
    /// Ran to completion; `None` when terminated by a signal
    Exited { code: Option<i32> },
    /// Could not be started or waited on
    SpawnFailed(String),
}

/// Raw execution output for a single test case
#[derive(Debug, Clone)]
pub struct TestExecutionOutput {
    pub test_id: String,
    pub outcome: ProcessOutcome,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

/// Normalize output string for comparison
pub fn normalize_output(output: &str) -> String {
    let joined = output
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim_end().to_string()
}

/// Cut `message` to [`MAX_MESSAGE_CHARS`] characters, marking the cut
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}{}", &message[..cut], TRUNCATION_SUFFIX),
        None => message.to_string(),
    }
}

/// Classify a single test case.
///
/// `expected` is `None` when the `.out` file is missing or unreadable.
pub fn evaluate_test(output: &TestExecutionOutput, expected: Option<&str>) -> TestCaseResult {
    let (status, message) = match &output.outcome {
        ProcessOutcome::TimedOut => (Verdict::TimeLimitExceeded, None),
        ProcessOutcome::OutputLimitExceeded { limit_bytes } => (
            Verdict::RuntimeError,
            Some(format!("output limit exceeded ({} bytes)", limit_bytes)),
        ),
        ProcessOutcome::SpawnFailed(reason) => {
            (Verdict::RuntimeError, Some(truncate_message(reason)))
        }
        ProcessOutcome::Exited { code } if *code != Some(0) => {
            let message = if output.stderr.is_empty() {
                match code {
                    Some(code) => format!("process exited with status {}", code),
                    None => "process terminated by signal".to_string(),
                }
            } else {
                truncate_message(&output.stderr)
            };
            (Verdict::RuntimeError, Some(message))
        }
        ProcessOutcome::Exited { .. } => match expected {
            None => (
                Verdict::InternalError,
                Some("Expected output file not found".to_string()),
            ),
            Some(expected) => {
                let actual = normalize_output(&output.stdout);
                let expected = normalize_output(expected);

                if actual == expected {
                    (Verdict::Accepted, None)
                } else {
                    (
                        Verdict::WrongAnswer,
                        Some(format!(
                            "expected length {}, got {}",
                            expected.len(),
                            actual.len()
                        )),
                    )
                }
            }
        },
    };

    TestCaseResult {
        id: output.test_id.clone(),
        status,
        time_ms: output.execution_time_ms,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to create an output from a process that exited normally
    fn make_output(code: i32, stdout: &str, stderr: &str) -> TestExecutionOutput {
        TestExecutionOutput {
            test_id: "1".to_string(),
            outcome: ProcessOutcome::Exited { code: Some(code) },
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            execution_time_ms: 42,
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello"), "hello");
        assert_eq!(normalize_output("hello\n"), "hello");
        assert_eq!(normalize_output("hello  \n\n"), "hello");
        assert_eq!(normalize_output("a\r\nb\r\n"), "a\nb");
        assert_eq!(normalize_output("  indented"), "  indented");
        assert_eq!(normalize_output(""), "");
        assert_eq!(normalize_output(" \r\n "), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        let samples = [
            "hello",
            "a\r\r\nb",
            "x\r\n\r\ny \t\r\n",
            "\r",
            "line1\nline2\r",
            "  lead\r\r\r\n",
            "tab\t\n\t",
        ];
        for s in samples {
            let once = normalize_output(s);
            assert_eq!(normalize_output(&once), once, "not idempotent for {:?}", s);
            assert!(!once.contains("\r\n"));
        }
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short"), "short");

        let exact = "x".repeat(MAX_MESSAGE_CHARS);
        assert_eq!(truncate_message(&exact), exact);

        let long = "y".repeat(MAX_MESSAGE_CHARS + 5);
        let cut = truncate_message(&long);
        assert!(cut.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(cut.chars().count(), MAX_MESSAGE_CHARS + TRUNCATION_SUFFIX.len());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_MESSAGE_CHARS + 1);
        let cut = truncate_message(&long);
        assert!(cut.starts_with(&"é".repeat(MAX_MESSAGE_CHARS)));
        assert!(cut.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_evaluate_accepted_with_crlf() {
        let output = make_output(0, "hello\r\n", "");
        let result = evaluate_test(&output, Some("hello\n"));

        assert_eq!(result.status, Verdict::Accepted);
        assert_eq!(result.id, "1");
        assert_eq!(result.time_ms, 42);
        assert_eq!(result.message, None);
    }

    #[test]
    fn test_evaluate_wrong_answer_reports_lengths() {
        let output = make_output(0, "hell", "");
        let result = evaluate_test(&output, Some("hello"));

        assert_eq!(result.status, Verdict::WrongAnswer);
        assert_eq!(result.message.as_deref(), Some("expected length 5, got 4"));
    }

    #[test]
    fn test_case_sensitivity() {
        let output = make_output(0, "Hello", "");
        assert_eq!(evaluate_test(&output, Some("hello")).status, Verdict::WrongAnswer);
    }

    #[test]
    fn test_evaluate_runtime_error_uses_stderr() {
        let output = make_output(1, "", "Traceback: ZeroDivisionError");
        let result = evaluate_test(&output, Some("whatever"));

        assert_eq!(result.status, Verdict::RuntimeError);
        assert_eq!(result.message.as_deref(), Some("Traceback: ZeroDivisionError"));
    }

    #[test]
    fn test_evaluate_runtime_error_without_stderr() {
        let mut output = make_output(0, "", "");
        output.outcome = ProcessOutcome::Exited { code: None };
        let result = evaluate_test(&output, Some(""));

        assert_eq!(result.status, Verdict::RuntimeError);
        assert_eq!(result.message.as_deref(), Some("process terminated by signal"));
    }

    #[test]
    fn test_evaluate_spawn_failure() {
        let mut output = make_output(0, "", "");
        output.outcome = ProcessOutcome::SpawnFailed("No such file or directory".to_string());

        let result = evaluate_test(&output, Some(""));
        assert_eq!(result.status, Verdict::RuntimeError);
    }

    #[test]
    fn test_evaluate_output_limit() {
        let mut output = make_output(0, "", "");
        output.outcome = ProcessOutcome::OutputLimitExceeded { limit_bytes: 1024 };

        let result = evaluate_test(&output, Some(""));
        assert_eq!(result.status, Verdict::RuntimeError);
        assert_eq!(result.message.as_deref(), Some("output limit exceeded (1024 bytes)"));

        // Still classified when the expected file is missing
        assert_eq!(evaluate_test(&output, None).status, Verdict::RuntimeError);
    }

    #[test]
    fn test_evaluate_missing_expected() {
        let output = make_output(0, "hello", "");
        let result = evaluate_test(&output, None);

        assert_eq!(result.status, Verdict::InternalError);
    }

    #[test]
    fn test_classification_priority() {
        // Timeout beats everything, even a non-zero exit and a missing .out
        let mut output = make_output(1, "", "partial");
        output.outcome = ProcessOutcome::TimedOut;
        assert_eq!(evaluate_test(&output, None).status, Verdict::TimeLimitExceeded);

        // Runtime error beats a missing expected file
        let output = make_output(2, "hello", "oops");
        assert_eq!(evaluate_test(&output, None).status, Verdict::RuntimeError);

        // Missing expected beats output comparison
        let output = make_output(0, "", "");
        assert_eq!(evaluate_test(&output, None).status, Verdict::InternalError);

        // Same inputs, same verdict
        let output = make_output(0, "42", "");
        let first = evaluate_test(&output, Some("42\n"));
        let second = evaluate_test(&output, Some("42\n"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_stderr_ignored_on_success() {
        let output = make_output(0, "ok", "warning: deprecated");
        assert_eq!(evaluate_test(&output, Some("ok")).status, Verdict::Accepted);
    }
}
