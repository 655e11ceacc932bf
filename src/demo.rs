use std::path::Path;

use rand::Rng;
use tracing::info;

use crate::tracking::{now_millis, RunStatus, TrackingError, TrackingStore};

const ARTIFACT_NAME: &str = "metrics.txt";

/// Log a small stepwise run (loss curve, jittered latency, one artifact) so a
/// fresh tracking store has something to browse. Returns the run id.
pub async fn log_demo_run(
    store: &dyn TrackingStore,
    experiment: &str,
    model: &str,
    steps: i64,
    scratch_dir: &Path,
) -> Result<String, TrackingError> {
    let experiment = store.set_experiment(experiment).await?;
    let run_name = format!("demo-{}", now_millis() / 1000);
    let run_id = store
        .create_run(&experiment.experiment_id, &run_name)
        .await?;

    store.log_param(&run_id, "model", model).await?;
    for step in 0..steps {
        let loss = 1.0 / (step + 1) as f64;
        let latency_ms = f64::from(rand::thread_rng().gen_range(50u32..=120));
        store.log_metric(&run_id, "loss", loss, step).await?;
        store.log_metric(&run_id, "latency_ms", latency_ms, step).await?;
    }

    let artifact = scratch_dir.join(ARTIFACT_NAME);
    tokio::fs::write(&artifact, "ok\n").await?;
    store.log_artifact(&run_id, &artifact).await?;
    store.end_run(&run_id, RunStatus::Finished).await?;

    info!(run_id, run_name, experiment = %experiment.name, "demo run logged");
    Ok(run_id)
}
