use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{Backend, BackendError, Completion};
use crate::config::ConfigError;
use crate::metrics::{MetricsSink, RunParams, RunRecord};
use crate::protocol::{ChatRequest, ChatResult, DEFAULT_TEMPERATURE};
use crate::tokens::count_tokens;
use crate::tracking::TrackingError;

/// Everything a chat call can fail with, mapped to HTTP statuses by the server.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("tracking store unavailable: {0}")]
    Tracking(#[from] TrackingError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Config(_) => StatusCode::BAD_REQUEST,
            RelayError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RelayError::Backend(e) => e.status(),
            RelayError::Tracking(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Forwards chat requests to the configured backend and records one run per attempt.
pub struct ChatRelay {
    backend: Result<Arc<dyn Backend>, ConfigError>,
    http_client: reqwest::Client,
    sink: Arc<dyn MetricsSink>,
    timeout: Duration,
}

impl ChatRelay {
    /// `backend` is the startup resolution result; an error is returned to
    /// every caller without contacting anything.
    pub fn new(
        backend: Result<Arc<dyn Backend>, ConfigError>,
        http_client: reqwest::Client,
        sink: Arc<dyn MetricsSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            http_client,
            sink,
            timeout,
        }
    }

    pub async fn handle(&self, req: ChatRequest) -> Result<ChatResult, RelayError> {
        let backend = self.backend.as_ref().map_err(|e| e.clone())?;
        if req.prompt.is_empty() {
            return Err(RelayError::InvalidRequest("prompt must not be empty".into()));
        }

        let model = req
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| backend.default_model().to_string());
        let temperature = req.temperature.unwrap_or(DEFAULT_TEMPERATURE);

        let start = Instant::now();
        let input_tokens = count_tokens(&req.prompt);
        let params = RunParams {
            backend: backend.name().to_string(),
            model: model.clone(),
            temperature,
            prompt_length: req.prompt.chars().count(),
            input_tokens,
        };

        let completion = Completion {
            model: &model,
            prompt: &req.prompt,
            temperature,
        };
        let outcome = match tokio::time::timeout(
            self.timeout,
            backend.complete(&self.http_client, &completion),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.timeout.as_secs())),
        };
        let latency = start.elapsed();

        match outcome {
            Ok(output) => {
                let record = RunRecord::success(params, latency, count_tokens(&output));
                info!(
                    backend = backend.name(),
                    model,
                    latency_ms = record.metrics.latency_ms,
                    input_tokens,
                    output_tokens = record.metrics.output_tokens,
                    "chat completed"
                );
                self.sink.record(&record).await?;
                Ok(ChatResult { model, output })
            }
            Err(err) => {
                let record = RunRecord::failure(params, latency);
                warn!(
                    backend = backend.name(),
                    model,
                    latency_ms = record.metrics.latency_ms,
                    error = %err,
                    "chat failed"
                );
                self.sink.record(&record).await?;
                Err(err.into())
            }
        }
    }
}
