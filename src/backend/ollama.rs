use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::url::endpoint_url;
use super::{post_json, Backend, BackendError, Completion};
use crate::config::{BackendConfig, ConfigError};

const GENERATE_PATH: &str = "/api/generate";

/// Ollama backend: non-streaming `POST /api/generate`.
pub struct Ollama {
    base_url: String,
    endpoint: String,
    default_model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: GenerateOptions,
    stream: bool,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

impl Ollama {
    pub fn new(config: BackendConfig) -> Result<Self, ConfigError> {
        let endpoint =
            endpoint_url(&config.base_url, GENERATE_PATH).map_err(ConfigError::InvalidBaseUrl)?;
        Ok(Self {
            base_url: config.base_url,
            endpoint,
            default_model: config.default_model,
        })
    }
}

/// The `response` field when the body is JSON carrying one, else the raw body.
fn extract_output(body: String) -> String {
    serde_json::from_str::<GenerateResponse>(&body)
        .ok()
        .and_then(|r| r.response)
        .unwrap_or(body)
}

#[async_trait]
impl Backend for Ollama {
    fn name(&self) -> &str {
        "ollama"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(
        &self,
        client: &reqwest::Client,
        completion: &Completion<'_>,
    ) -> Result<String, BackendError> {
        let body = GenerateRequest {
            model: completion.model,
            prompt: completion.prompt,
            options: GenerateOptions {
                temperature: completion.temperature,
            },
            stream: false,
        };
        let text = post_json(self, client, &self.endpoint, &body).await?;
        Ok(extract_output(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(base_url: &str) -> Ollama {
        Ollama::new(BackendConfig {
            kind: BackendKind::Generate,
            base_url: base_url.to_string(),
            api_key: None,
            default_model: "llama3".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_extract_output() {
        assert_eq!(extract_output(r#"{"response":"hi there"}"#.into()), "hi there");
        assert_eq!(extract_output(r#"{"done":true}"#.into()), r#"{"done":true}"#);
        assert_eq!(extract_output("plain text".into()), "plain text");
        assert_eq!(extract_output(r#"{"response":42}"#.into()), r#"{"response":42}"#);
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let err = Ollama::new(BackendConfig {
            kind: BackendKind::Generate,
            base_url: "not a url".into(),
            api_key: None,
            default_model: "llama3".into(),
        })
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::InvalidBaseUrl(_)));
    }

    #[tokio::test]
    async fn test_generate_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_json(json!({
                "model": "mistral",
                "prompt": "why is the sky blue",
                "options": { "temperature": 0.7 },
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "mistral",
                "response": "Rayleigh scattering.",
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let output = backend(&server.uri())
            .complete(
                &reqwest::Client::new(),
                &Completion {
                    model: "mistral",
                    prompt: "why is the sky blue",
                    temperature: 0.7,
                },
            )
            .await
            .unwrap();
        assert_eq!(output, "Rayleigh scattering.");
    }

    #[tokio::test]
    async fn test_error_status_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"error":"model 'x' not found"}"#),
            )
            .mount(&server)
            .await;

        let err = backend(&server.uri())
            .complete(
                &reqwest::Client::new(),
                &Completion {
                    model: "x",
                    prompt: "hi",
                    temperature: 0.2,
                },
            )
            .await
            .unwrap_err();
        match err {
            BackendError::Upstream { status, body } => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
