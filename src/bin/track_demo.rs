use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use llmops_relay::demo::log_demo_run;
use llmops_relay::tracking::open_store;

/// Log a demo run to the tracking store.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Tracking store: "file:<dir>", a bare directory, or an http(s) MLflow server
    #[arg(long, default_value = "file:./mlruns", env = "MLFLOW_TRACKING_URI")]
    tracking_uri: String,

    /// Experiment receiving the demo run
    #[arg(long, default_value = "local-demo", env = "MLFLOW_EXPERIMENT")]
    experiment: String,

    /// Model name recorded as a parameter
    #[arg(long, default_value = "llama3", env = "MODEL")]
    model: String,

    /// Number of metric steps to log
    #[arg(long, default_value_t = 10)]
    steps: i64,

    /// Directory for the temporary artifact file
    #[arg(long, default_value = ".")]
    scratch_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt().init();

    let store = match open_store(&args.tracking_uri, reqwest::Client::new()) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open tracking store");
            std::process::exit(1);
        }
    };

    match log_demo_run(
        store.as_ref(),
        &args.experiment,
        &args.model,
        args.steps,
        &args.scratch_dir,
    )
    .await
    {
        Ok(_) => println!("Run logged. Check {} or your tracking server.", args.tracking_uri),
        Err(e) => {
            error!(error = %e, "failed to log demo run");
            std::process::exit(1);
        }
    }
}
