//! HTTP surface of the drafter backend.

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Drafter API",
        version = "0.1.0",
        description = "Streaming proposal generation: conversational reply, plan description and per-file drafts"
    ),
    paths(
        routes::health_check,
        routes::create_proposal,
        routes::get_proposal,
        routes::get_proposal_plan,
        routes::abort_proposal,
        routes::drain_proposal,
        routes::sse::events_stream,
    ),
    components(schemas(
        routes::HealthResponse,
        error::ErrorResponse,
        drafter_core::ProposalRequest,
        drafter_core::ContextFile,
        drafter_core::Proposal,
        drafter_core::ProposalStatus,
        drafter_core::PlanDescription,
        drafter_core::Phase,
        drafter_core::Plan,
        drafter_core::PlanStatus,
        drafter_core::PlanChunk,
        drafter_core::FileStatus,
        drafter_core::FileStatusChunk,
        drafter_core::FileFailure,
        drafter_core::FileFailureKind,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "proposals", description = "Proposal generation and lifecycle"),
        (name = "events", description = "Real-time lifecycle events (SSE)"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route("/api/proposals", post(routes::create_proposal))
        .route(
            "/api/proposals/{id}",
            get(routes::get_proposal).delete(routes::drain_proposal),
        )
        .route("/api/proposals/{id}/plan", get(routes::get_proposal_plan))
        .route("/api/proposals/{id}/abort", post(routes::abort_proposal))
        .route("/api/events", get(routes::sse::events_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
