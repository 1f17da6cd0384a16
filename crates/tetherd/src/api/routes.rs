//! API route definitions.

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::auth::auth_middleware;
use super::handlers;
use super::state::AppState;
use crate::ws;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Paired clients connect from app webviews with arbitrary origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Tracing layer with request timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    // Protected routes (require a paired bearer token)
    let protected_routes = Router::new()
        .route("/agent/state", get(handlers::agent_state))
        .route("/agent/messages", get(handlers::agent_messages))
        .route("/agent/prompt", post(handlers::agent_prompt))
        .route("/agent/abort", post(handlers::agent_abort))
        .route("/agent/model", post(handlers::agent_set_model))
        .route("/agent/models", get(handlers::agent_models))
        .route("/agent/session/new", post(handlers::agent_new_session))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Public routes: health and the pairing handshake itself
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/pair", get(handlers::pairing_status))
        .route("/pair", post(handlers::pair));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}
