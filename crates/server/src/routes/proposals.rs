use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use drafter_core::{ChunkTag, Plan, Proposal, ProposalRequest, WireChunk};
use futures::stream::{Stream, StreamExt};

use crate::error::AppError;
use crate::routes::sse::SSE_KEEP_ALIVE_INTERVAL;
use crate::state::AppState;

/// SSE framing rejects carriage returns, so raw text deltas are folded to `\n`.
fn sse_data(data: &str) -> String {
    if data.contains('\r') {
        data.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        data.to_string()
    }
}

fn chunk_to_sse_event(chunk: &WireChunk) -> Result<Event, Infallible> {
    let event = match chunk.encode() {
        Ok(frame) => Event::default()
            .event(frame.event)
            .data(sse_data(&frame.data)),
        Err(e) => {
            tracing::error!("Failed to encode {} chunk: {}", chunk.tag().as_str(), e);
            Event::default()
                .event(ChunkTag::Error.as_str())
                .data(format!("failed to encode chunk: {}", e))
        }
    };
    Ok(event)
}

#[utoipa::path(
    post,
    path = "/api/proposals",
    request_body = ProposalRequest,
    responses(
        (status = 200, description = "SSE stream of proposal chunks (proposal, replying/revising, describing, building, finished, error)"),
        (status = 400, description = "Invalid request", body = crate::error::ErrorResponse),
    ),
    tag = "proposals"
)]
pub async fn create_proposal(
    State(state): State<AppState>,
    Json(request): Json<ProposalRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if request.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("Prompt must not be empty".to_string()));
    }

    if let Some(parent_id) = &request.parent_proposal_id {
        if parent_id.trim().is_empty() {
            return Err(AppError::BadRequest(
                "Parent proposal id must not be empty".to_string(),
            ));
        }
    }

    let stream = state.runner.start(request)?;
    tracing::debug!("Streaming proposal {}", stream.proposal_id());

    let events = stream.map(|chunk| chunk_to_sse_event(&chunk));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

#[utoipa::path(
    get,
    path = "/api/proposals/{id}",
    params(
        ("id" = String, Path, description = "Proposal ID")
    ),
    responses(
        (status = 200, description = "Proposal record", body = Proposal),
        (status = 404, description = "Proposal not found", body = crate::error::ErrorResponse),
    ),
    tag = "proposals"
)]
pub async fn get_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Proposal>, AppError> {
    let session = state
        .registry()
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Proposal not found: {}", id)))?;

    Ok(Json(session.snapshot()))
}

#[utoipa::path(
    get,
    path = "/api/proposals/{id}/plan",
    params(
        ("id" = String, Path, description = "Proposal ID")
    ),
    responses(
        (status = 200, description = "Plan snapshot", body = Plan),
        (status = 404, description = "Proposal not found or no plan made", body = crate::error::ErrorResponse),
    ),
    tag = "proposals"
)]
pub async fn get_proposal_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Plan>, AppError> {
    let session = state
        .registry()
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Proposal not found: {}", id)))?;

    let plan = session
        .plan_snapshot()
        .ok_or_else(|| AppError::NotFound(format!("Proposal {} has no plan", id)))?;

    Ok(Json(plan))
}

#[utoipa::path(
    post,
    path = "/api/proposals/{id}/abort",
    params(
        ("id" = String, Path, description = "Proposal ID")
    ),
    responses(
        (status = 204, description = "Proposal aborted, or already terminal"),
        (status = 404, description = "Proposal not found", body = crate::error::ErrorResponse),
    ),
    tag = "proposals"
)]
pub async fn abort_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.runner.abort(&id)? {
        tracing::info!("Aborted proposal {}", id);
    }
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/proposals/{id}",
    params(
        ("id" = String, Path, description = "Proposal ID")
    ),
    responses(
        (status = 204, description = "Proposal drained"),
        (status = 404, description = "Proposal not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Proposal still running", body = crate::error::ErrorResponse),
    ),
    tag = "proposals"
)]
pub async fn drain_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.registry().drain(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_data_folds_carriage_returns() {
        assert_eq!(sse_data("a\r\nb\rc\nd"), "a\nb\nc\nd");
        assert_eq!(sse_data("plain"), "plain");
    }

    #[test]
    fn test_chunk_to_sse_event_does_not_panic_on_crlf() {
        let chunk = WireChunk::Reply("line one\r\nline two".to_string());
        let _event = chunk_to_sse_event(&chunk).unwrap();
    }
}
