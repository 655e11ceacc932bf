pub mod errors;
pub mod ollama;
pub mod openai;
pub mod url;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{BackendConfig, BackendKind, ConfigError};

pub use errors::BackendError;
pub use ollama::Ollama;
pub use openai::OpenAiChat;

/// One chat completion to run against a backend.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub temperature: f64,
}

/// Backend trait for LLM inference backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name recorded as the `backend` run parameter.
    fn name(&self) -> &str;

    /// Base URL the backend was configured with.
    fn base_url(&self) -> &str;

    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;

    /// Add authentication to an outgoing request.
    fn authorize_request(&self, _headers: &mut http::HeaderMap) {}

    /// Run one completion and return the generated text.
    async fn complete(
        &self,
        client: &reqwest::Client,
        completion: &Completion<'_>,
    ) -> Result<String, BackendError>;
}

/// Build the backend selected by the resolved configuration.
pub fn from_config(config: BackendConfig) -> Result<Arc<dyn Backend>, ConfigError> {
    Ok(match config.kind {
        BackendKind::Generate => Arc::new(Ollama::new(config)?),
        BackendKind::OpenAiChat => Arc::new(OpenAiChat::new(config)?),
    })
}

/// POST a JSON body and return the response text. Non-2xx answers become
/// `BackendError::Upstream` carrying the status and body.
pub(crate) async fn post_json<B: Serialize + ?Sized>(
    backend: &dyn Backend,
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<String, BackendError> {
    let mut request = client.post(url).json(body).build()?;
    backend.authorize_request(request.headers_mut());

    let resp = client.execute(request).await?;
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(BackendError::Upstream {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(text)
}
