pub mod errors;
pub mod file;
pub mod rest;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConfigError;

pub use errors::TrackingError;
pub use file::FileStore;
pub use rest::RestStore;

/// A named grouping of runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
}

/// Lifecycle of a run. Numeric codes match the MLflow file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn code(self) -> i32 {
        match self {
            RunStatus::Running => 1,
            RunStatus::Scheduled => 2,
            RunStatus::Finished => 3,
            RunStatus::Failed => 4,
            RunStatus::Killed => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(RunStatus::Running),
            2 => Some(RunStatus::Scheduled),
            3 => Some(RunStatus::Finished),
            4 => Some(RunStatus::Failed),
            5 => Some(RunStatus::Killed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RUNNING" => Some(RunStatus::Running),
            "SCHEDULED" => Some(RunStatus::Scheduled),
            "FINISHED" => Some(RunStatus::Finished),
            "FAILED" => Some(RunStatus::Failed),
            "KILLED" => Some(RunStatus::Killed),
            _ => None,
        }
    }
}

/// A stored run with its latest parameter and metric values.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub run_name: Option<String>,
    pub status: Option<RunStatus>,
    pub start_time: i64,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
}

/// Experiment-tracking backend shared by the relay's sink and the analyzer.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Look up an active experiment by name.
    async fn get_experiment_by_name(&self, name: &str)
        -> Result<Option<Experiment>, TrackingError>;

    /// Get or create the named experiment.
    async fn set_experiment(&self, name: &str) -> Result<Experiment, TrackingError>;

    /// Start a run and return its id.
    async fn create_run(&self, experiment_id: &str, run_name: &str)
        -> Result<String, TrackingError>;

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<(), TrackingError>;

    async fn log_metric(
        &self,
        run_id: &str,
        key: &str,
        value: f64,
        step: i64,
    ) -> Result<(), TrackingError>;

    /// Store a local file among the run's artifacts.
    async fn log_artifact(&self, run_id: &str, path: &Path) -> Result<(), TrackingError>;

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError>;

    /// All runs of an experiment, newest first.
    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>, TrackingError>;
}

/// Open the store behind a tracking URI: `file:<dir>` or a bare directory
/// for the local file store, `http(s)://` for an MLflow tracking server.
pub fn open_store(
    uri: &str,
    http_client: reqwest::Client,
) -> Result<Arc<dyn TrackingStore>, ConfigError> {
    let uri = uri.trim();
    if let Some(rest) = uri.strip_prefix("file:") {
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if path.is_empty() {
            return Err(ConfigError::UnsupportedTrackingUri(uri.to_string()));
        }
        return Ok(Arc::new(FileStore::new(path)));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Arc::new(RestStore::new(uri, http_client)));
    }
    if uri.is_empty() || uri.contains("://") {
        return Err(ConfigError::UnsupportedTrackingUri(uri.to_string()));
    }
    Ok(Arc::new(FileStore::new(uri)))
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
