//! Library interface for `penny-api`.
//!
//! Exposes the HTTP/SSE surface's internal modules and [`router`] so
//! integration tests can drive the real `axum::Router` in-process, the same
//! split `querymt-worker` uses between its `lib.rs` and `main.rs`. The
//! binary entry point lives in `main.rs`.

pub mod auth;
pub mod error;
pub mod routes;
pub mod sse;
pub mod state;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Builds the full external interface over a given [`AppState`].
///
/// Split out of `main` so tests can construct a state with in-memory stores
/// and a [`penny_provider::mock::MockAdapter`] and exercise it through real
/// HTTP requests via `tower::ServiceExt::oneshot`, without a bound socket.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(routes::messages::send_message))
        .route("/v1/tools/{name}/execute", post(routes::tools::execute_tool))
        .route("/v1/sandbox/execute", post(routes::sandbox::execute))
        .route("/v1/sandbox/execute/stream", post(routes::sandbox::execute_stream))
        .route("/v1/sandbox/sessions", post(routes::sandbox::create_session))
        .route("/v1/sandbox/sessions/{id}", delete(routes::sandbox::close_session))
        .route("/v1/api-keys", post(routes::api_keys::issue).get(routes::api_keys::list))
        .route("/v1/api-keys/{id}", delete(routes::api_keys::revoke))
        .route("/healthz", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
