use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::json;

use super::{now_millis, Experiment, Run, RunStatus, TrackingError, TrackingStore};

const SEARCH_PAGE_SIZE: u32 = 1000;
const ARTIFACT_SCHEME: &str = "mlflow-artifacts:";

/// Client for an MLflow tracking server's 2.0 REST API.
pub struct RestStore {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentBody,
}

#[derive(Deserialize)]
struct ExperimentBody {
    experiment_id: String,
    name: String,
    #[serde(default)]
    lifecycle_stage: Option<String>,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunEnvelope {
    run: RunBody,
}

#[derive(Deserialize)]
struct RunBody {
    info: RunInfo,
    #[serde(default)]
    data: RunData,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
    #[serde(default)]
    run_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    start_time: Option<i64>,
    #[serde(default)]
    artifact_uri: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RunData {
    metrics: Vec<MetricEntry>,
    params: Vec<KeyValue>,
    tags: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct MetricEntry {
    key: String,
    value: f64,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct SearchRunsResponse {
    runs: Vec<RunBody>,
    next_page_token: Option<String>,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{path}", self.base_url)
    }

    async fn post<R: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<R, TrackingError> {
        let resp = self.client.post(self.endpoint(path)).json(&body).send().await?;
        decode(resp).await
    }

    async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<R, TrackingError> {
        let resp = self
            .client
            .get(self.endpoint(path))
            .query(query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn create_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let created: CreateExperimentResponse = self
            .post("experiments/create", json!({ "name": name }))
            .await?;
        Ok(created.experiment_id)
    }
}

async fn decode<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, TrackingError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(TrackingError::Api {
            status: status.as_u16(),
            body,
        });
    }
    let body = resp.text().await?;
    // Some endpoints answer 200 with no body.
    let body = if body.trim().is_empty() { "null" } else { body.as_str() };
    serde_json::from_str(body).map_err(|e| TrackingError::Decode(e.to_string()))
}

fn into_run(body: RunBody) -> Run {
    let run_name = body.info.run_name.filter(|n| !n.is_empty()).or_else(|| {
        body.data
            .tags
            .iter()
            .find(|t| t.key == "mlflow.runName")
            .map(|t| t.value.clone())
    });
    Run {
        run_id: body.info.run_id,
        run_name,
        status: body.info.status.as_deref().and_then(RunStatus::parse),
        start_time: body.info.start_time.unwrap_or_default(),
        params: body
            .data
            .params
            .into_iter()
            .map(|p| (p.key, p.value))
            .collect::<BTreeMap<_, _>>(),
        metrics: body
            .data
            .metrics
            .into_iter()
            .map(|m| (m.key, m.value))
            .collect(),
    }
}

#[async_trait]
impl TrackingStore for RestStore {
    fn name(&self) -> &str {
        "rest"
    }

    async fn get_experiment_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Experiment>, TrackingError> {
        let found: Result<ExperimentEnvelope, _> = self
            .get("experiments/get-by-name", &[("experiment_name", name)])
            .await;
        match found {
            Ok(envelope) => {
                let experiment = envelope.experiment;
                if experiment.lifecycle_stage.as_deref().unwrap_or("active") != "active" {
                    return Ok(None);
                }
                Ok(Some(Experiment {
                    experiment_id: experiment.experiment_id,
                    name: experiment.name,
                }))
            }
            Err(TrackingError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn set_experiment(&self, name: &str) -> Result<Experiment, TrackingError> {
        if let Some(existing) = self.get_experiment_by_name(name).await? {
            return Ok(existing);
        }
        match self.create_experiment(name).await {
            Ok(experiment_id) => Ok(Experiment {
                experiment_id,
                name: name.to_string(),
            }),
            // Another writer created it between our lookup and create.
            Err(TrackingError::Api { body, .. }) if body.contains("RESOURCE_ALREADY_EXISTS") => self
                .get_experiment_by_name(name)
                .await?
                .ok_or_else(|| TrackingError::NotFound(format!("experiment {name}"))),
            Err(e) => Err(e),
        }
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<String, TrackingError> {
        let created: RunEnvelope = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": now_millis(),
                    "tags": [{ "key": "mlflow.runName", "value": run_name }],
                }),
            )
            .await?;
        Ok(created.run.info.run_id)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<(), TrackingError> {
        let _: IgnoredAny = self
            .post(
                "runs/log-parameter",
                json!({ "run_id": run_id, "key": key, "value": value }),
            )
            .await?;
        Ok(())
    }

    async fn log_metric(
        &self,
        run_id: &str,
        key: &str,
        value: f64,
        step: i64,
    ) -> Result<(), TrackingError> {
        let _: IgnoredAny = self
            .post(
                "runs/log-metric",
                json!({
                    "run_id": run_id,
                    "key": key,
                    "value": value,
                    "timestamp": now_millis(),
                    "step": step,
                }),
            )
            .await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, path: &Path) -> Result<(), TrackingError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TrackingError::InvalidKey(path.display().to_string()))?;

        let run: RunEnvelope = self.get("runs/get", &[("run_id", run_id)]).await?;
        let artifact_uri = run.run.info.artifact_uri.unwrap_or_default();
        let artifact_path = artifact_uri
            .strip_prefix(ARTIFACT_SCHEME)
            .map(|rest| rest.trim_start_matches('/').trim_end_matches('/'))
            .ok_or_else(|| TrackingError::UnsupportedArtifactUri(artifact_uri.clone()))?;

        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{artifact_path}/{file_name}",
            self.base_url
        );
        let contents = tokio::fs::read(path).await?;
        let resp = self.client.put(url).body(contents).send().await?;
        let _: IgnoredAny = decode(resp).await?;
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError> {
        let _: IgnoredAny = self
            .post(
                "runs/update",
                json!({
                    "run_id": run_id,
                    "status": status.as_str(),
                    "end_time": now_millis(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>, TrackingError> {
        let mut runs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut body = json!({
                "experiment_ids": [experiment_id],
                "max_results": SEARCH_PAGE_SIZE,
                "order_by": ["attributes.start_time DESC"],
            });
            if let Some(token) = &page_token {
                body["page_token"] = json!(token);
            }
            let page: SearchRunsResponse = self.post("runs/search", body).await?;
            runs.extend(page.runs.into_iter().map(into_run));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> RestStore {
        RestStore::new(format!("{}/", server.uri()), reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_set_experiment_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/experiments/get-by-name"))
            .and(query_param("experiment_name", "llmops-api"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error_code": "RESOURCE_DOES_NOT_EXIST",
                "message": "Could not find experiment with name 'llmops-api'"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/experiments/create"))
            .and(body_partial_json(json!({ "name": "llmops-api" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "experiment_id": "7" })))
            .expect(1)
            .mount(&server)
            .await;

        let experiment = store(&server).set_experiment("llmops-api").await.unwrap();
        assert_eq!(experiment.experiment_id, "7");
        assert_eq!(experiment.name, "llmops-api");
    }

    #[tokio::test]
    async fn test_set_experiment_reuses_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/experiments/get-by-name"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "experiment": {
                    "experiment_id": "3",
                    "name": "llmops-api",
                    "lifecycle_stage": "active"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/experiments/create"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let experiment = store(&server).set_experiment("llmops-api").await.unwrap();
        assert_eq!(experiment.experiment_id, "3");
    }

    #[tokio::test]
    async fn test_run_lifecycle_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/create"))
            .and(body_partial_json(json!({ "experiment_id": "3", "run_name": "chat-request" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "run": { "info": { "run_id": "abc123", "status": "RUNNING" } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/log-parameter"))
            .and(body_partial_json(json!({ "run_id": "abc123", "key": "model", "value": "llama3" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/log-metric"))
            .and(body_partial_json(json!({ "run_id": "abc123", "key": "success", "value": 1.0, "step": 0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/update"))
            .and(body_partial_json(json!({ "run_id": "abc123", "status": "FINISHED" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server);
        let run_id = store.create_run("3", "chat-request").await.unwrap();
        assert_eq!(run_id, "abc123");
        store.log_param(&run_id, "model", "llama3").await.unwrap();
        store.log_metric(&run_id, "success", 1.0, 0).await.unwrap();
        store.end_run(&run_id, RunStatus::Finished).await.unwrap();
    }

    #[tokio::test]
    async fn test_search_runs_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/search"))
            .and(body_partial_json(json!({ "page_token": "next" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "runs": [{
                    "info": { "run_id": "r2", "status": "FAILED", "start_time": 1 },
                    "data": { "metrics": [{ "key": "success", "value": 0.0 }] }
                }]
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "runs": [{
                    "info": { "run_id": "r1", "status": "FINISHED", "start_time": 2 },
                    "data": {
                        "metrics": [{ "key": "latency_ms", "value": 120.5 }],
                        "params": [{ "key": "temperature", "value": "0.2" }],
                        "tags": [{ "key": "mlflow.runName", "value": "chat-request" }]
                    }
                }],
                "next_page_token": "next"
            })))
            .with_priority(2)
            .mount(&server)
            .await;

        let runs = store(&server).search_runs("3").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "r1");
        assert_eq!(runs[0].run_name.as_deref(), Some("chat-request"));
        assert_eq!(runs[0].metrics.get("latency_ms"), Some(&120.5));
        assert_eq!(runs[0].params.get("temperature").map(String::as_str), Some("0.2"));
        assert_eq!(runs[1].status, Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn test_server_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/create"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = store(&server).create_run("3", "chat-request").await.unwrap_err();
        match err {
            TrackingError::Api { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_success_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/create"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy login</html>"))
            .mount(&server)
            .await;

        let err = store(&server).create_run("3", "chat-request").await.unwrap_err();
        assert!(matches!(err, TrackingError::Decode(_)), "got {err}");
        assert!(err.to_string().starts_with("malformed tracking server response"));
    }

    #[tokio::test]
    async fn test_empty_success_body_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/mlflow/runs/update"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).end_run("abc123", RunStatus::Finished).await.unwrap();
    }

    #[tokio::test]
    async fn test_log_artifact_uploads_through_proxy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/mlflow/runs/get"))
            .and(query_param("run_id", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "run": { "info": {
                    "run_id": "abc123",
                    "artifact_uri": "mlflow-artifacts:/3/abc123/artifacts"
                } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/2.0/mlflow-artifacts/artifacts/3/abc123/artifacts/metrics.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("metrics.txt");
        std::fs::write(&artifact, "ok\n").unwrap();
        store(&server).log_artifact("abc123", &artifact).await.unwrap();
    }
}
