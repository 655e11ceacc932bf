use axum::http::StatusCode;
use thiserror::Error;

/// Failures talking to an inference backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend answered with a non-2xx status. Displays as the upstream body.
    #[error("{body}")]
    Upstream { status: u16, body: String },

    #[error("{0}")]
    Transport(String),

    #[error("backend did not respond within {0} seconds")]
    Timeout(u64),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Status reported to the relay's client: the upstream error status when
    /// there is one, 500 otherwise.
    pub fn status(&self) -> StatusCode {
        match self {
            BackendError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Transport(e.to_string())
    }
}
