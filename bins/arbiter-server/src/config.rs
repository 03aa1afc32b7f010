// Server configuration, read from the environment at boot
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub redis_url: String,
    pub bind_addr: String,
    /// Parent directory of the per-job workspaces
    pub execution_directory: PathBuf,
    /// Supervisor binary copied into every workspace
    pub runner_binary_path: PathBuf,
    /// Where problem bundles are unpacked
    pub cache_directory: PathBuf,
    /// Remote problem package source; local cache only when unset
    pub problem_api_url: Option<String>,
    pub problem_api_key: Option<String>,
    /// Used for jobs submitted without their own callback URL
    pub callback_url: Option<String>,
    pub container_timeout: Duration,
    pub max_workers: usize,
    pub queue_size: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let container_timeout_secs: u64 = parse(&lookup, "CONTAINER_TIMEOUT_SECONDS", 600)?;
        let max_workers: usize = parse(&lookup, "MAX_WORKERS", 3)?;
        let queue_size: usize = parse(&lookup, "QUEUE_SIZE", 10)?;

        if max_workers == 0 {
            bail!("MAX_WORKERS must be at least 1");
        }
        if queue_size == 0 {
            bail!("QUEUE_SIZE must be at least 1");
        }
        if container_timeout_secs == 0 {
            bail!("CONTAINER_TIMEOUT_SECONDS must be at least 1");
        }

        Ok(Self {
            redis_url: get("REDIS_URL", "redis://127.0.0.1:6379"),
            bind_addr: get("BIND_ADDR", "0.0.0.0:8080"),
            execution_directory: PathBuf::from(get("EXECUTION_DIRECTORY", "data/executions")),
            runner_binary_path: PathBuf::from(get("RUNNER_BINARY_PATH", "bin/runner")),
            cache_directory: PathBuf::from(get("CACHE_DIRECTORY", "data/problems")),
            problem_api_url: optional("PROBLEM_API_URL"),
            problem_api_key: optional("PROBLEM_API_KEY"),
            callback_url: optional("CALLBACK_URL"),
            container_timeout: Duration::from_secs(container_timeout_secs),
            max_workers,
            queue_size,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Failed to parse {}={:?}", key, raw)),
        None => Ok(default),
    }
}
