use async_trait::async_trait;
use http::HeaderValue;
use serde::{Deserialize, Serialize};

use super::url::endpoint_url;
use super::{post_json, Backend, BackendError, Completion};
use crate::config::{BackendConfig, ConfigError};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_API_KEY: &str = "EMPTY";

/// OpenAI-compatible backend (vLLM): non-streaming `POST /v1/chat/completions`.
pub struct OpenAiChat {
    base_url: String,
    endpoint: String,
    default_model: String,
    authorization: HeaderValue,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

impl OpenAiChat {
    pub fn new(config: BackendConfig) -> Result<Self, ConfigError> {
        let endpoint = endpoint_url(&config.base_url, CHAT_COMPLETIONS_PATH)
            .map_err(ConfigError::InvalidBaseUrl)?;
        let api_key = config
            .api_key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_API_KEY.to_string());
        let mut authorization = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ConfigError::InvalidApiKey)?;
        authorization.set_sensitive(true);

        Ok(Self {
            base_url: config.base_url,
            endpoint,
            default_model: config.default_model,
            authorization,
        })
    }
}

fn extract_output(body: &str) -> Result<String, BackendError> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BackendError::InvalidResponse("missing choices[0].message.content".into()))
}

#[async_trait]
impl Backend for OpenAiChat {
    fn name(&self) -> &str {
        "vllm"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn authorize_request(&self, headers: &mut http::HeaderMap) {
        headers.insert(http::header::AUTHORIZATION, self.authorization.clone());
    }

    async fn complete(
        &self,
        client: &reqwest::Client,
        completion: &Completion<'_>,
    ) -> Result<String, BackendError> {
        let body = ChatCompletionRequest {
            model: completion.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: completion.prompt,
                },
            ],
            temperature: completion.temperature,
            stream: false,
        };
        let text = post_json(self, client, &self.endpoint, &body).await?;
        extract_output(&text)
    }
}
