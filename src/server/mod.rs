pub mod handlers;
pub mod logging;

use std::sync::Arc;

use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::relay::ChatRelay;

use self::handlers::AppState;

/// Build the axum router.
pub fn build_router(relay: ChatRelay) -> Router {
    let state = Arc::new(AppState { relay });

    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .layer(axum_middleware::from_fn(logging::logging_middleware))
        .with_state(state)
}
