use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Languages the judge knows how to run.
///
/// Each variant maps to a container image and an interpreter invocation.
/// Supporting a new language means adding a variant here, never branching
/// on raw language tokens elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
}

impl Language {
    /// Container image the submission runs in
    pub fn image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.12-slim",
            Language::JavaScript => "node:20-slim",
        }
    }

    /// Filename the submission is written to inside the workspace
    pub fn source_file(&self) -> &'static str {
        match self {
            Language::Python => "source.py",
            Language::JavaScript => "source.js",
        }
    }

    /// Interpreter invocation, the source filename is appended by the caller
    pub fn interpreter(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &["python3", "-u"],
            Language::JavaScript => &["node"],
        }
    }

    /// Full command the runner executes for every test case
    pub fn command(&self) -> Vec<String> {
        self.interpreter()
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(self.source_file().to_string()))
            .collect()
    }

    pub fn all() -> &'static [Language] {
        &[Language::Python, Language::JavaScript]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            other => Err(UnsupportedLanguage(other.to_string())),
        }
    }
}

/// A submission accepted by the scheduler.
///
/// The id is assigned once at creation; nothing else changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub language: Language,
    pub code: String,
    /// Local directory holding the `<id>.in` / `<id>.out` pairs
    pub bundle_path: PathBuf,
    /// Per-test wall-clock limit enforced by the runner
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Everything needed to create a [`Job`] except its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub language: Language,
    pub code: String,
    pub bundle_path: PathBuf,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub callback_url: Option<String>,
}

impl Job {
    pub fn from_request(id: String, request: JobRequest) -> Self {
        Job {
            id,
            language: request.language,
            code: request.code,
            bundle_path: request.bundle_path,
            time_limit_ms: request.time_limit_ms,
            memory_limit_mb: request.memory_limit_mb,
            callback_url: request.callback_url,
        }
    }
}

/// Lifecycle of a job record.
///
/// Transitions only move forward: Queued -> Processing -> {Success, Error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    /// Whether a record in `self` may be overwritten with `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => true,
            // Recovery re-runs interrupted jobs, so Processing may repeat
            JobStatus::Processing => next != JobStatus::Queued,
            JobStatus::Success | JobStatus::Error => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub result: ExecutionReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResult {
    pub fn queued(id: &str) -> Self {
        Self::with_status(id, JobStatus::Queued)
    }

    pub fn processing(id: &str) -> Self {
        Self::with_status(id, JobStatus::Processing)
    }

    pub fn success(id: &str, report: ExecutionReport) -> Self {
        JobResult {
            id: id.to_string(),
            status: JobStatus::Success,
            result: report,
            error_message: None,
        }
    }

    pub fn error(id: &str, message: impl Into<String>) -> Self {
        JobResult {
            id: id.to_string(),
            status: JobStatus::Error,
            result: ExecutionReport::default(),
            error_message: Some(message.into()),
        }
    }

    fn with_status(id: &str, status: JobStatus) -> Self {
        JobResult {
            id: id.to_string(),
            status,
            result: ExecutionReport::default(),
            error_message: None,
        }
    }
}

/// Per-test classification written by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "RTE")]
    RuntimeError,
    #[serde(rename = "IER")]
    InternalError,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::RuntimeError => "RTE",
            Verdict::InternalError => "IER",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub id: String,
    pub status: Verdict,
    pub time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Results in test discovery order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub results: Vec<TestCaseResult>,
}

impl ExecutionReport {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.results.iter().filter(|r| r.status == verdict).count()
    }
}

/// Limits a problem declares for one language, read from its `meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageLimits {
    pub language: String,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
}
