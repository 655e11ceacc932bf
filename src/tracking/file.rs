use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{now_millis, Experiment, Run, RunStatus, TrackingError, TrackingStore};

const META_FILE: &str = "meta.yaml";
const RUN_NAME_TAG: &str = "mlflow.runName";
const ACTIVE: &str = "active";
const DEFAULT_EXPERIMENT_ID: &str = "0";

/// Local tracking store using the MLflow `mlruns/` directory layout, so
/// `mlflow ui` can browse what the relay writes.
pub struct FileStore {
    root: PathBuf,
    // Serialises experiment creation so concurrent requests agree on one id.
    create_lock: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ExperimentMeta {
    artifact_location: String,
    creation_time: Option<i64>,
    experiment_id: String,
    last_update_time: Option<i64>,
    lifecycle_stage: String,
    name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunMeta {
    artifact_uri: String,
    end_time: Option<i64>,
    entry_point_name: String,
    experiment_id: String,
    lifecycle_stage: String,
    run_id: String,
    run_name: Option<String>,
    run_uuid: String,
    source_name: String,
    source_type: i32,
    source_version: String,
    start_time: i64,
    status: i32,
    tags: Vec<serde_yaml::Value>,
    user_id: String,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create_lock: Mutex::new(()),
        }
    }

    /// Create the root with its `Default` experiment on first use.
    async fn ensure_root(&self) -> Result<(), TrackingError> {
        let default_dir = self.root.join(DEFAULT_EXPERIMENT_ID);
        if fs::try_exists(default_dir.join(META_FILE)).await? {
            return Ok(());
        }
        fs::create_dir_all(&default_dir).await?;
        self.write_experiment(DEFAULT_EXPERIMENT_ID, "Default").await
    }

    async fn write_experiment(&self, id: &str, name: &str) -> Result<(), TrackingError> {
        let dir = self.root.join(id);
        fs::create_dir_all(&dir).await?;
        let now = now_millis();
        let meta = ExperimentMeta {
            artifact_location: file_uri(&dir).await?,
            creation_time: Some(now),
            experiment_id: id.to_string(),
            last_update_time: Some(now),
            lifecycle_stage: ACTIVE.to_string(),
            name: name.to_string(),
        };
        fs::write(dir.join(META_FILE), serde_yaml::to_string(&meta)?).await?;
        Ok(())
    }

    async fn experiments(&self) -> Result<Vec<ExperimentMeta>, TrackingError> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            let raw = match fs::read_to_string(&meta_path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_yaml::from_str::<ExperimentMeta>(&raw) {
                Ok(meta) => found.push(meta),
                Err(e) => warn!(path = %meta_path.display(), error = %e, "skipping unreadable experiment"),
            }
        }
        Ok(found)
    }

    async fn next_experiment_id(&self) -> Result<String, TrackingError> {
        let max = self
            .experiments()
            .await?
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok((max + 1).to_string())
    }

    /// Locate a run directory by scanning experiments.
    async fn run_dir(&self, run_id: &str) -> Result<PathBuf, TrackingError> {
        validate_key(run_id)?;
        for experiment in self.experiments().await? {
            let dir = self.root.join(&experiment.experiment_id).join(run_id);
            if fs::try_exists(dir.join(META_FILE)).await? {
                return Ok(dir);
            }
        }
        Err(TrackingError::NotFound(format!("run {run_id}")))
    }

    async fn read_run(&self, dir: &Path) -> Result<Option<Run>, TrackingError> {
        let raw = match fs::read_to_string(dir.join(META_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: RunMeta = serde_yaml::from_str(&raw)?;
        if meta.lifecycle_stage != ACTIVE {
            return Ok(None);
        }

        let params = read_values(&dir.join("params")).await?;
        let metrics = read_values(&dir.join("metrics"))
            .await?
            .into_iter()
            .filter_map(|(key, raw)| latest_metric(&raw).map(|v| (key, v)))
            .collect();
        let run_name = read_values(&dir.join("tags"))
            .await?
            .remove(RUN_NAME_TAG)
            .or(meta.run_name);

        let run_id = if meta.run_id.is_empty() {
            meta.run_uuid
        } else {
            meta.run_id
        };

        Ok(Some(Run {
            run_id,
            run_name,
            status: RunStatus::from_code(meta.status),
            start_time: meta.start_time,
            params,
            metrics,
        }))
    }
}

#[async_trait]
impl TrackingStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_experiment_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Experiment>, TrackingError> {
        Ok(self
            .experiments()
            .await?
            .into_iter()
            .find(|e| e.name == name && e.lifecycle_stage == ACTIVE)
            .map(|e| Experiment {
                experiment_id: e.experiment_id,
                name: e.name,
            }))
    }

    async fn set_experiment(&self, name: &str) -> Result<Experiment, TrackingError> {
        let _guard = self.create_lock.lock().await;
        self.ensure_root().await?;
        if let Some(existing) = self.get_experiment_by_name(name).await? {
            return Ok(existing);
        }
        let id = self.next_experiment_id().await?;
        self.write_experiment(&id, name).await?;
        Ok(Experiment {
            experiment_id: id,
            name: name.to_string(),
        })
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<String, TrackingError> {
        validate_key(experiment_id)?;
        let experiment_dir = self.root.join(experiment_id);
        if !fs::try_exists(experiment_dir.join(META_FILE)).await? {
            return Err(TrackingError::NotFound(format!("experiment {experiment_id}")));
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let dir = experiment_dir.join(&run_id);
        for sub in ["params", "metrics", "tags", "artifacts"] {
            fs::create_dir_all(dir.join(sub)).await?;
        }

        let meta = RunMeta {
            artifact_uri: file_uri(&dir.join("artifacts")).await?,
            end_time: None,
            experiment_id: experiment_id.to_string(),
            lifecycle_stage: ACTIVE.to_string(),
            run_id: run_id.clone(),
            run_name: Some(run_name.to_string()),
            run_uuid: run_id.clone(),
            source_type: 4,
            start_time: now_millis(),
            status: RunStatus::Running.code(),
            ..RunMeta::default()
        };
        fs::write(dir.join(META_FILE), serde_yaml::to_string(&meta)?).await?;
        fs::write(dir.join("tags").join(RUN_NAME_TAG), run_name).await?;
        Ok(run_id)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<(), TrackingError> {
        validate_key(key)?;
        let dir = self.run_dir(run_id).await?;
        fs::write(dir.join("params").join(key), value).await?;
        Ok(())
    }

    async fn log_metric(
        &self,
        run_id: &str,
        key: &str,
        value: f64,
        step: i64,
    ) -> Result<(), TrackingError> {
        validate_key(key)?;
        let dir = self.run_dir(run_id).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics").join(key))
            .await?;
        let line = format!("{} {} {}\n", now_millis(), value, step);
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, path: &Path) -> Result<(), TrackingError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| TrackingError::InvalidKey(path.display().to_string()))?;
        let dir = self.run_dir(run_id).await?;
        fs::copy(path, dir.join("artifacts").join(file_name)).await?;
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError> {
        let dir = self.run_dir(run_id).await?;
        let meta_path = dir.join(META_FILE);
        let mut meta: RunMeta = serde_yaml::from_str(&fs::read_to_string(&meta_path).await?)?;
        meta.status = status.code();
        meta.end_time = Some(now_millis());
        fs::write(&meta_path, serde_yaml::to_string(&meta)?).await?;
        Ok(())
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>, TrackingError> {
        validate_key(experiment_id)?;
        let experiment_dir = self.root.join(experiment_id);
        let mut entries = match fs::read_dir(&experiment_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TrackingError::NotFound(format!("experiment {experiment_id}")))
            }
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(run) = self.read_run(&entry.path()).await? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }
}

/// Keys become file names; reject anything that could escape the run directory.
fn validate_key(key: &str) -> Result<(), TrackingError> {
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
        return Err(TrackingError::InvalidKey(key.to_string()));
    }
    Ok(())
}

async fn file_uri(path: &Path) -> Result<String, TrackingError> {
    let absolute = fs::canonicalize(path).await?;
    Ok(format!("file://{}", absolute.display()))
}

/// Read every regular file in `dir` into a key -> contents map.
async fn read_values(dir: &Path) -> Result<BTreeMap<String, String>, TrackingError> {
    let mut values = BTreeMap::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(values),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().into_owned();
        values.insert(key, fs::read_to_string(entry.path()).await?);
    }
    Ok(values)
}

/// The value column of the last `timestamp value step` line.
fn latest_metric(raw: &str) -> Option<f64> {
    raw.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}
