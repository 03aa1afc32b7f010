// Route table for the Arbiter API

use axum::{
    routing::{get, post},
    Router,
};
use arbiter_common::store::JobStore;
use std::sync::Arc;

use crate::executor::JobExecutor;
use crate::handlers;
use crate::AppState;

pub fn routes<S: JobStore, E: JobExecutor>() -> Router<Arc<AppState<S, E>>> {
    Router::new()
        .route("/submissions", post(handlers::submit_job::<S, E>))
        .route("/submissions/:token", get(handlers::get_job_result::<S, E>))
        .route("/status", get(handlers::health_check))
}
