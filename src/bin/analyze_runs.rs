use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use llmops_relay::analyzer::{self, DEFAULT_EXPORT_PATH};
use llmops_relay::tracking::open_store;

/// Summarise, compare and export the relay's logged chat runs.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Tracking store: "file:<dir>", a bare directory, or an http(s) MLflow server
    #[arg(long, default_value = "file:./mlruns", env = "MLFLOW_TRACKING_URI")]
    tracking_uri: String,

    /// Experiment holding the relay's runs
    #[arg(long, default_value = "llmops-api", env = "MLFLOW_EXPERIMENT")]
    experiment: String,

    /// Where to write the flattened CSV export
    #[arg(long, default_value = DEFAULT_EXPORT_PATH)]
    export_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let store = match open_store(&args.tracking_uri, reqwest::Client::new()) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open tracking store");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&args, store.as_ref()).await {
        error!(error = %e, "failed to write report");
        std::process::exit(1);
    }
}

async fn run(args: &Args, store: &dyn llmops_relay::tracking::TrackingStore) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "\n🔍 Run Metrics Analysis")?;
    writeln!(out, "{}", "=".repeat(80))?;

    let runs = analyzer::list_runs(store, &args.experiment).await;
    if runs.is_empty() {
        writeln!(
            out,
            "No runs found in experiment '{}'. Send requests to POST /chat with MLFLOW_ENABLED=1 to generate data.",
            args.experiment
        )?;
        return Ok(());
    }

    analyzer::summarize(&runs, &mut out)?;
    analyzer::compare_by_temperature(&runs, &mut out)?;
    analyzer::aggregate_stats(&runs, &mut out)?;

    let written = analyzer::export_csv(&runs, &args.export_path)?;
    writeln!(
        out,
        "\n✅ Exported {written} runs to {}",
        args.export_path.display()
    )?;
    Ok(())
}
