use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::OrchestratorError;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Orchestrator(err) => match err {
                OrchestratorError::ProposalNotFound(id) => (
                    StatusCode::NOT_FOUND,
                    "not_found",
                    format!("Proposal not found: {}", id),
                ),
                OrchestratorError::SessionRunning(id) => (
                    StatusCode::CONFLICT,
                    "conflict",
                    format!("Proposal still running: {}", id),
                ),
                OrchestratorError::ProtocolViolation(msg) => {
                    (StatusCode::CONFLICT, "protocol_violation", msg)
                }
                _ => {
                    tracing::error!("Orchestrator error: {:?}", err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "orchestrator_error",
                        err.to_string(),
                    )
                }
            },
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Orchestrator(err)
    }
}
