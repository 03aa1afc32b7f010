mod callback;
mod config;
mod engine;
mod executor;
mod handlers;
mod problems;
mod routes;
mod scheduler;
mod workspace;

#[cfg(test)]
mod testing;

use anyhow::Context;
use arbiter_common::redis::RedisJobStore;
use axum::Router;
use config::ServerConfig;
use engine::DockerEngine;
use executor::DockerExecutor;
use problems::{ProblemCache, ProblemSource};
use scheduler::{Scheduler, SchedulerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct AppState<S, E> {
    pub scheduler: Arc<Scheduler<S, E>>,
    pub problems: Arc<ProblemCache>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Arbiter server booting...");

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    info!(
        workers = config.max_workers,
        queue_size = config.queue_size,
        container_timeout_secs = config.container_timeout.as_secs(),
        execution_directory = %config.execution_directory.display(),
        "Configuration loaded"
    );

    if !config.runner_binary_path.is_file() {
        warn!(
            path = %config.runner_binary_path.display(),
            "Runner binary not found, every job will fail until it is installed"
        );
    }

    // Nothing owns a workspace yet, anything left is from a crash
    if let Err(e) = workspace::purge_stale_workspaces(&config.execution_directory) {
        error!(error = %e, "Failed to purge stale workspaces");
    }

    let store = RedisJobStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let engine = DockerEngine::connect().context("Failed to connect to Docker daemon")?;
    let executor = DockerExecutor::new(
        engine,
        config.execution_directory.clone(),
        config.runner_binary_path.clone(),
        config.container_timeout,
    );

    let scheduler = Arc::new(
        Scheduler::start(
            Arc::new(store),
            Arc::new(executor),
            SchedulerConfig {
                workers: config.max_workers,
                queue_size: config.queue_size,
                default_callback_url: config.callback_url.clone(),
            },
        )
        .await,
    );

    let source = config.problem_api_url.clone().map(|api_url| ProblemSource {
        api_url,
        api_key: config.problem_api_key.clone(),
    });
    let problems = ProblemCache::new(config.cache_directory.clone(), source)
        .context("Failed to create problem cache directory")?;

    let state = Arc::new(AppState {
        scheduler: Arc::clone(&scheduler),
        problems: Arc::new(problems),
    });

    let app = Router::new()
        .merge(routes::routes::<RedisJobStore, DockerExecutor>())
        .with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler.shutdown().await;

    info!("Arbiter server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => warn!("Received shutdown signal, stopping..."),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
