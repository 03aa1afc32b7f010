// HTTP route handlers for the Arbiter API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use arbiter_common::store::{JobStore, StoreError};
use arbiter_common::types::{JobRequest, Language};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::executor::JobExecutor;
use crate::problems::ProblemError;
use crate::scheduler::SchedulerError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub problem_id: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
    pub callback_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub token: String,
    pub message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

/// POST /submissions - Submit code against a problem
pub async fn submit_job<S: JobStore, E: JobExecutor>(
    State(state): State<Arc<AppState<S, E>>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid JSON format: {}", rejection.body_text()),
            );
        }
    };

    if payload.problem_id.is_empty() || payload.code.is_empty() || payload.language.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing required fields (problem_id, code, language)",
        );
    }

    let language: Language = match payload.language.parse() {
        Ok(language) => language,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let problem = match state.problems.get_problem_data(&payload.problem_id).await {
        Ok(problem) => problem,
        Err(ProblemError::NotFound(id)) => {
            return error_response(StatusCode::NOT_FOUND, format!("Problem {} not found", id));
        }
        Err(e @ ProblemError::InvalidId(_)) => {
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
        Err(e) => {
            error!(problem_id = %payload.problem_id, error = %e, "Failed to load problem data");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let Some(limits) = problem.limits_for(language) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Language {} is not enabled for problem {}",
                language, payload.problem_id
            ),
        );
    };

    let request = JobRequest {
        language,
        code: payload.code,
        bundle_path: problem.bundle_dir.clone(),
        time_limit_ms: limits.time_limit_ms,
        memory_limit_mb: limits.memory_limit_mb,
        callback_url: payload.callback_url,
    };

    match state.scheduler.enqueue(request).await {
        Ok(token) => {
            info!(
                job_id = %token,
                problem_id = %payload.problem_id,
                language = %language,
                "Submission enqueued"
            );
            (
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    token,
                    message: "Submission enqueued successfully".to_string(),
                }),
            )
                .into_response()
        }
        Err(e @ (SchedulerError::QueueFull | SchedulerError::ShuttingDown)) => {
            warn!(problem_id = %payload.problem_id, error = %e, "Submission rejected");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e @ SchedulerError::Persistence(_)) => {
            error!(problem_id = %payload.problem_id, error = %e, "Failed to enqueue submission");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /submissions/{token} - Latest state of a submission
pub async fn get_job_result<S: JobStore, E: JobExecutor>(
    State(state): State<Arc<AppState<S, E>>>,
    Path(token): Path<String>,
) -> Response {
    match state.scheduler.get_result(&token).await {
        Ok(result) => {
            info!(job_id = %token, status = %result.status, "Job result retrieved");
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(StoreError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "Submission not found")
        }
        Err(e) => {
            error!(job_id = %token, error = %e, "Failed to fetch job result");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to query job status: {}", e),
            )
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
