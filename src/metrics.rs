use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::tracking::{open_store, RunStatus, TrackingError, TrackingStore};

/// Run name given to every chat request run.
pub const RUN_NAME: &str = "chat-request";

/// Parameters of one relay call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub backend: String,
    pub model: String,
    pub temperature: f64,
    /// Prompt length in characters.
    pub prompt_length: usize,
    pub input_tokens: usize,
}

/// Outcome metrics of one relay call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetrics {
    pub latency_ms: f64,
    pub latency_sec: f64,
    pub success: bool,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
    pub tokens_per_second: f64,
}

/// One logged relay attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub params: RunParams,
    pub metrics: RunMetrics,
}

impl RunRecord {
    pub fn success(params: RunParams, latency: Duration, output_tokens: usize) -> Self {
        let latency_sec = latency.as_secs_f64();
        let tokens_per_second = if latency_sec > 0.0 {
            output_tokens as f64 / latency_sec
        } else {
            0.0
        };
        let input_tokens = params.input_tokens;
        Self {
            params,
            metrics: RunMetrics {
                latency_ms: latency_sec * 1000.0,
                latency_sec,
                success: true,
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                tokens_per_second,
            },
        }
    }

    pub fn failure(params: RunParams, latency: Duration) -> Self {
        let latency_sec = latency.as_secs_f64();
        let input_tokens = params.input_tokens;
        Self {
            params,
            metrics: RunMetrics {
                latency_ms: latency_sec * 1000.0,
                latency_sec,
                success: false,
                input_tokens,
                output_tokens: 0,
                total_tokens: input_tokens,
                tokens_per_second: 0.0,
            },
        }
    }

    /// Parameters as the string values the store records.
    pub fn param_entries(&self) -> Vec<(&'static str, String)> {
        let p = &self.params;
        vec![
            ("backend", p.backend.clone()),
            ("model", p.model.clone()),
            ("temperature", p.temperature.to_string()),
            ("prompt_length", p.prompt_length.to_string()),
            ("input_tokens", p.input_tokens.to_string()),
        ]
    }

    pub fn metric_entries(&self) -> Vec<(&'static str, f64)> {
        let m = &self.metrics;
        vec![
            ("latency_ms", m.latency_ms),
            ("latency_sec", m.latency_sec),
            ("success", if m.success { 1.0 } else { 0.0 }),
            ("input_tokens", m.input_tokens as f64),
            ("output_tokens", m.output_tokens as f64),
            ("total_tokens", m.total_tokens as f64),
            ("tokens_per_second", m.tokens_per_second),
        ]
    }
}

/// Destination for run records.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, record: &RunRecord) -> Result<(), TrackingError>;
}

/// Sink used when tracking is disabled.
pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn record(&self, _record: &RunRecord) -> Result<(), TrackingError> {
        Ok(())
    }
}

/// Writes each record as its own run in a named experiment.
pub struct TrackingSink {
    store: Arc<dyn TrackingStore>,
    experiment: String,
}

impl TrackingSink {
    pub fn new(store: Arc<dyn TrackingStore>, experiment: impl Into<String>) -> Self {
        Self {
            store,
            experiment: experiment.into(),
        }
    }

    async fn log_record(&self, run_id: &str, record: &RunRecord) -> Result<(), TrackingError> {
        for (key, value) in record.param_entries() {
            self.store.log_param(run_id, key, &value).await?;
        }
        for (key, value) in record.metric_entries() {
            self.store.log_metric(run_id, key, value, 0).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsSink for TrackingSink {
    async fn record(&self, record: &RunRecord) -> Result<(), TrackingError> {
        let experiment = self.store.set_experiment(&self.experiment).await?;
        let run_id = self
            .store
            .create_run(&experiment.experiment_id, RUN_NAME)
            .await?;

        if let Err(e) = self.log_record(&run_id, record).await {
            if let Err(end_err) = self.store.end_run(&run_id, RunStatus::Failed).await {
                warn!(run_id, error = %end_err, "failed to mark run as failed");
            }
            return Err(e);
        }
        self.store.end_run(&run_id, RunStatus::Finished).await
    }
}

/// Build the sink selected by `MLFLOW_ENABLED`.
pub fn sink_from_config(
    config: &Config,
    http_client: reqwest::Client,
) -> Result<Arc<dyn MetricsSink>, ConfigError> {
    if !config.tracking_enabled() {
        info!("run tracking disabled");
        return Ok(Arc::new(NoopSink));
    }
    let store = open_store(&config.mlflow_tracking_uri, http_client)?;
    info!(
        store = store.name(),
        uri = %config.mlflow_tracking_uri,
        experiment = %config.mlflow_experiment,
        "run tracking enabled"
    );
    Ok(Arc::new(TrackingSink::new(store, &config.mlflow_experiment)))
}
