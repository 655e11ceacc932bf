use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::protocol::{ChatRequest, ErrorResponse, HealthResponse};
use crate::relay::{ChatRelay, RelayError};

/// Shared application state.
pub struct AppState {
    pub relay: ChatRelay,
}

/// Health check handler.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Chat handler: relays one prompt to the configured backend.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return write_error(rejection.status(), &rejection.body_text()),
    };

    match state.relay.handle(req).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        write_error(self.status(), &self.to_string())
    }
}

fn write_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            detail: message.to_string(),
        }),
    )
        .into_response()
}
