use std::time::Duration;

use clap::Parser;
use thiserror::Error;

/// LLMOps relay: forwards chat requests to a self-hosted LLM backend.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Listen address (e.g. ":8000" or "0.0.0.0:8000")
    #[arg(long, default_value = ":8000", env = "ADDR")]
    pub addr: String,

    /// Log format: "text" or "json"
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    pub log_format: String,

    /// Base URL of an Ollama-style generate backend
    #[arg(long, env = "OLLAMA_BASE_URL")]
    pub ollama_base_url: Option<String>,

    /// Default model for the generate backend
    #[arg(long, default_value = "llama3", env = "OLLAMA_MODEL")]
    pub ollama_model: String,

    /// Base URL of a vLLM OpenAI-compatible backend
    #[arg(long, env = "VLLM_OPENAI_BASE_URL")]
    pub vllm_openai_base_url: Option<String>,

    /// Default model for the OpenAI-compatible backend
    #[arg(
        long,
        default_value = "meta-llama/Llama-3-8B-Instruct",
        env = "VLLM_MODEL"
    )]
    pub vllm_model: String,

    /// Bearer token sent to the OpenAI-compatible backend
    #[arg(long, default_value = "EMPTY", env = "VLLM_API_KEY")]
    pub vllm_api_key: String,

    /// Enable run tracking ("1", "true" or "yes")
    #[arg(long, env = "MLFLOW_ENABLED")]
    pub mlflow_enabled: Option<String>,

    /// Experiment that receives one run per chat request
    #[arg(long, default_value = "llmops-api", env = "MLFLOW_EXPERIMENT")]
    pub mlflow_experiment: String,

    /// Tracking store: "file:<dir>", a bare directory, or an http(s) MLflow server
    #[arg(long, default_value = "file:./mlruns", env = "MLFLOW_TRACKING_URI")]
    pub mlflow_tracking_uri: String,

    /// Upper bound on every backend call, in seconds
    #[arg(long, default_value_t = 120, env = "REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,
}

/// Which wire protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `POST /api/generate` (Ollama).
    Generate,
    /// `POST /v1/chat/completions` (vLLM and other OpenAI-compatible servers).
    OpenAiChat,
}

/// The single backend the relay talks to, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Set OLLAMA_BASE_URL or VLLM_OPENAI_BASE_URL env var.")]
    NoBackend,

    #[error("Both OLLAMA_BASE_URL and VLLM_OPENAI_BASE_URL are set; configure exactly one backend.")]
    AmbiguousBackend,

    #[error("invalid backend base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("VLLM_API_KEY is not a valid header value")]
    InvalidApiKey,

    #[error("unsupported tracking URI: {0}")]
    UnsupportedTrackingUri(String),
}

impl Config {
    /// Pick the backend from the configured base URLs. Exactly one must be non-empty.
    pub fn backend_config(&self) -> Result<BackendConfig, ConfigError> {
        let ollama = non_empty(self.ollama_base_url.as_deref());
        let vllm = non_empty(self.vllm_openai_base_url.as_deref());

        match (ollama, vllm) {
            (Some(base_url), None) => Ok(BackendConfig {
                kind: BackendKind::Generate,
                base_url: base_url.to_string(),
                api_key: None,
                default_model: self.ollama_model.clone(),
            }),
            (None, Some(base_url)) => Ok(BackendConfig {
                kind: BackendKind::OpenAiChat,
                base_url: base_url.to_string(),
                api_key: Some(self.vllm_api_key.clone()),
                default_model: self.vllm_model.clone(),
            }),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousBackend),
            (None, None) => Err(ConfigError::NoBackend),
        }
    }

    pub fn tracking_enabled(&self) -> bool {
        self.mlflow_enabled.as_deref().is_some_and(is_truthy)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Parse a feature-flag value. Only "1", "true" and "yes" (any case) enable.
pub fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

/// Convert ":8000" to "0.0.0.0:8000".
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
impl Config {
    /// Defaults without consulting the process environment.
    pub(crate) fn for_tests() -> Self {
        Self {
            addr: "127.0.0.1:0".into(),
            log_format: "text".into(),
            ollama_base_url: None,
            ollama_model: "llama3".into(),
            vllm_openai_base_url: None,
            vllm_model: "meta-llama/Llama-3-8B-Instruct".into(),
            vllm_api_key: "EMPTY".into(),
            mlflow_enabled: None,
            mlflow_experiment: "llmops-api".into(),
            mlflow_tracking_uri: "file:./mlruns".into(),
            request_timeout_secs: 120,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
