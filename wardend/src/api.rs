//! JSON/HTTP API: a thin read-only subset of the agent surface.
//!
//! `/api/health` and `/api/version` are public; the system endpoints
//! require the same bearer token as the RPC transport. CORS is permissive
//! so browser dashboards can talk to the agent directly.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::server::AgentState;

/// Response envelope shared by every endpoint.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message.into()),
        }),
    )
        .into_response()
}

/// Bearer check against the shared auth gate.
async fn auth_middleware(
    State(state): State<Arc<AgentState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(|value| state.auth.verify_bearer(value))
        .unwrap_or(false);

    if !authorized {
        return error(StatusCode::UNAUTHORIZED, "invalid or missing bearer token");
    }
    next.run(request).await
}

pub fn build_router(state: Arc<AgentState>) -> Router {
    let protected = Router::new()
        .route("/api/system", get(handle_system))
        .route("/api/metrics", get(handle_metrics))
        .route("/api/processes", get(handle_processes))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/version", get(handle_version))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_health() -> Response {
    ok(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn handle_version(State(state): State<Arc<AgentState>>) -> Response {
    ok(serde_json::json!({
        "name": "wardend",
        "version": state.version,
    }))
}

async fn handle_system(State(state): State<Arc<AgentState>>) -> Response {
    ok(state.probe.static_info().await)
}

async fn handle_metrics(State(state): State<Arc<AgentState>>) -> Response {
    ok(state.collector.collect().await)
}

async fn handle_processes(State(state): State<Arc<AgentState>>) -> Response {
    ok(state.probe.list_processes().await)
}
