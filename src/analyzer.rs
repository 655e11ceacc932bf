use std::fmt::Display;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tracing::warn;

use crate::tracking::{Run, RunStatus, TrackingStore};

/// Default location of the CSV export.
pub const DEFAULT_EXPORT_PATH: &str = "./mlruns/runs_export.csv";

const EXPORT_HEADER: [&str; 10] = [
    "run_id",
    "latency_ms",
    "latency_sec",
    "success",
    "input_tokens",
    "output_tokens",
    "total_tokens",
    "tokens_per_second",
    "temperature",
    "model",
];

/// A logged relay run with every field the reports use.
///
/// Runs are read once from the tracking store into `RunView`s; every report
/// below is computed in memory from that slice. Missing metrics are skipped
/// rather than treated as errors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunView {
    pub run_id: String,
    pub run_name: Option<String>,
    pub status: Option<RunStatus>,
    pub latency_ms: Option<f64>,
    pub latency_sec: Option<f64>,
    pub success: Option<f64>,
    pub input_tokens: Option<f64>,
    pub output_tokens: Option<f64>,
    pub total_tokens: Option<f64>,
    pub tokens_per_second: Option<f64>,
    /// The `temperature` parameter as logged.
    pub temperature: Option<String>,
    pub model: Option<String>,
    pub backend: Option<String>,
}

impl RunView {
    pub fn succeeded(&self) -> bool {
        self.success == Some(1.0)
    }

    pub fn temperature_value(&self) -> Option<f64> {
        self.temperature
            .as_deref()
            .and_then(|t| t.trim().parse::<f64>().ok())
            .filter(|t| t.is_finite())
    }

    /// Logged total, or input + output when the total is missing.
    pub fn total(&self) -> Option<f64> {
        self.total_tokens.or(match (self.input_tokens, self.output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        })
    }
}

impl From<Run> for RunView {
    fn from(mut run: Run) -> Self {
        let metric = |key: &str| run.metrics.get(key).copied();
        Self {
            latency_ms: metric("latency_ms"),
            latency_sec: metric("latency_sec"),
            success: metric("success"),
            input_tokens: metric("input_tokens"),
            output_tokens: metric("output_tokens"),
            total_tokens: metric("total_tokens"),
            tokens_per_second: metric("tokens_per_second"),
            temperature: run.params.remove("temperature"),
            model: run.params.remove("model"),
            backend: run.params.remove("backend"),
            run_id: run.run_id,
            run_name: run.run_name,
            status: run.status,
        }
    }
}

/// Per-temperature averages.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureGroup {
    pub temperature: f64,
    pub runs: usize,
    pub mean_latency_ms: Option<f64>,
    pub mean_output_tokens: Option<f64>,
    pub mean_tokens_per_second: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

/// Statistics over successful runs.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub successful_runs: usize,
    pub latency_ms: Option<Stats>,
    pub output_tokens: Option<Stats>,
    pub tokens_per_second: Option<Stats>,
}

/// Fetch every run of `experiment`. Missing experiments, empty experiments
/// and store failures all yield an empty list plus a warning.
pub async fn list_runs(store: &dyn TrackingStore, experiment: &str) -> Vec<RunView> {
    let found = match store.get_experiment_by_name(experiment).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            warn!(experiment, "experiment not found");
            return Vec::new();
        }
        Err(e) => {
            warn!(experiment, error = %e, "failed to look up experiment");
            return Vec::new();
        }
    };

    match store.search_runs(&found.experiment_id).await {
        Ok(runs) => {
            if runs.is_empty() {
                warn!(experiment, "experiment has no runs");
            }
            runs.into_iter().map(RunView::from).collect()
        }
        Err(e) => {
            warn!(experiment, error = %e, "failed to fetch runs");
            Vec::new()
        }
    }
}

/// Print one block per run.
pub fn summarize(runs: &[RunView], out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "\n📊 Run Summary")?;
    writeln!(out, "{}", "=".repeat(80))?;
    writeln!(out, "Total runs: {}\n", runs.len())?;

    for (idx, run) in runs.iter().enumerate() {
        let glyph = if run.succeeded() { "✅" } else { "❌" };
        let name = run.run_name.as_deref().unwrap_or(crate::metrics::RUN_NAME);
        writeln!(out, "{glyph} Run {}: {name}", idx + 1)?;
        if let Some(v) = run.input_tokens {
            writeln!(out, "   Input tokens:  {v:.0}")?;
        }
        if let Some(v) = run.output_tokens {
            writeln!(out, "   Output tokens: {v:.0}")?;
        }
        if let Some(v) = run.total() {
            writeln!(out, "   Total tokens:  {v:.0}")?;
        }
        if let Some(v) = run.latency_ms {
            writeln!(out, "   Latency:       {v:.0}ms")?;
        }
        if let Some(v) = run.tokens_per_second {
            writeln!(out, "   Throughput:    {v:.2} tokens/sec")?;
        }
        let short_id: String = run.run_id.chars().take(8).collect();
        writeln!(out, "   Run ID:        {short_id}")?;
        writeln!(out)?;
    }
    Ok(())
}

/// Group runs by numeric temperature, ascending. Runs without a parsable
/// temperature are left out.
pub fn group_by_temperature(runs: &[RunView]) -> Vec<TemperatureGroup> {
    let mut keyed: Vec<(f64, &RunView)> = runs
        .iter()
        .filter_map(|r| r.temperature_value().map(|t| (t, r)))
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut groups = Vec::new();
    let mut rest = keyed.as_slice();
    while let Some(&(temperature, _)) = rest.first() {
        // -0.0 and 0.0 compare equal, so they share a bucket.
        let len = rest.iter().take_while(|(t, _)| *t == temperature).count();
        let (group, tail) = rest.split_at(len);
        let members: Vec<&RunView> = group.iter().map(|(_, r)| *r).collect();
        groups.push(TemperatureGroup {
            temperature,
            runs: members.len(),
            mean_latency_ms: mean(members.iter().filter_map(|r| r.latency_ms)),
            mean_output_tokens: mean(members.iter().filter_map(|r| r.output_tokens)),
            mean_tokens_per_second: mean(members.iter().filter_map(|r| r.tokens_per_second)),
        });
        rest = tail;
    }
    groups
}

pub fn compare_by_temperature(runs: &[RunView], out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "\n🌡️  Temperature Impact Analysis")?;
    writeln!(out, "{}", "=".repeat(80))?;

    let groups = group_by_temperature(runs);
    let tested: Vec<String> = groups.iter().map(|g| g.temperature.to_string()).collect();
    writeln!(out, "\nTested temperatures: [{}]\n", tested.join(", "))?;

    for group in &groups {
        writeln!(out, "Temperature: {} ({} runs)", group.temperature, group.runs)?;
        writeln!(out, "  Avg latency:    {}ms", fmt_opt(group.mean_latency_ms, 0))?;
        writeln!(out, "  Avg output:     {} tokens", fmt_opt(group.mean_output_tokens, 0))?;
        writeln!(
            out,
            "  Avg throughput: {} tokens/sec",
            fmt_opt(group.mean_tokens_per_second, 2)
        )?;
        writeln!(out)?;
    }
    Ok(())
}

/// Statistics over successful runs, or `None` when there are none.
pub fn aggregate(runs: &[RunView]) -> Option<AggregateReport> {
    let successful: Vec<&RunView> = runs.iter().filter(|r| r.succeeded()).collect();
    if successful.is_empty() {
        return None;
    }
    let collect = |f: fn(&RunView) -> Option<f64>| -> Vec<f64> {
        successful.iter().filter_map(|r| f(r)).collect()
    };
    Some(AggregateReport {
        successful_runs: successful.len(),
        latency_ms: stats(&collect(|r| r.latency_ms)),
        output_tokens: stats(&collect(|r| r.output_tokens)),
        tokens_per_second: stats(&collect(|r| r.tokens_per_second)),
    })
}

pub fn aggregate_stats(runs: &[RunView], out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "\n📈 Aggregate Statistics")?;
    writeln!(out, "{}", "=".repeat(80))?;

    let Some(report) = aggregate(runs) else {
        writeln!(out, "No successful runs found.")?;
        return Ok(());
    };

    writeln!(out, "\nBased on {} successful runs:", report.successful_runs)?;
    write_stats(out, "Latency (ms)", report.latency_ms, 0, "ms")?;
    write_stats(out, "Output tokens", report.output_tokens, 0, "")?;
    write_stats(out, "Throughput (tokens/sec)", report.tokens_per_second, 2, "")?;
    writeln!(out)?;
    Ok(())
}

/// Write the flattened run table. Returns the number of rows written.
pub fn export_csv(runs: &[RunView], path: &Path) -> io::Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut csv = EXPORT_HEADER.join(",");
    csv.push('\n');
    for run in runs {
        let row = [
            csv_field(&run.run_id),
            num_cell(run.latency_ms),
            num_cell(run.latency_sec),
            num_cell(run.success),
            num_cell(run.input_tokens),
            num_cell(run.output_tokens),
            num_cell(run.total_tokens),
            num_cell(run.tokens_per_second),
            run.temperature.as_deref().map(csv_field).unwrap_or_default(),
            run.model.as_deref().map(csv_field).unwrap_or_default(),
        ];
        csv.push_str(&row.join(","));
        csv.push('\n');
    }
    fs::write(path, csv)?;
    Ok(runs.len())
}

fn write_stats(
    out: &mut impl Write,
    title: &str,
    stats: Option<Stats>,
    precision: usize,
    unit: &str,
) -> io::Result<()> {
    writeln!(out, "\n{title}:")?;
    let Some(s) = stats else {
        writeln!(out, "  n/a")?;
        return Ok(());
    };
    writeln!(out, "  Mean:   {:.*}{unit}", precision, s.mean)?;
    writeln!(out, "  Median: {:.*}{unit}", precision, s.median)?;
    writeln!(out, "  Min:    {:.*}{unit}", precision, s.min)?;
    writeln!(out, "  Max:    {:.*}{unit}", precision, s.max)?;
    Ok(())
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

fn stats(values: &[f64]) -> Option<Stats> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    Some(Stats {
        count: n,
        mean: sorted.iter().sum::<f64>() / n as f64,
        median,
        min: sorted[0],
        max: sorted[n - 1],
    })
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{v:.precision$}"),
        None => "n/a".to_string(),
    }
}

fn num_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn csv_field(value: impl Display) -> String {
    let value = value.to_string();
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn run(id: &str, temperature: &str, success: f64, latency_ms: f64, output: f64) -> RunView {
        RunView {
            run_id: id.to_string(),
            run_name: Some("chat-request".into()),
            latency_ms: Some(latency_ms),
            latency_sec: Some(latency_ms / 1000.0),
            success: Some(success),
            input_tokens: Some(2.0),
            output_tokens: Some(output),
            total_tokens: Some(2.0 + output),
            tokens_per_second: Some(output / (latency_ms / 1000.0)),
            temperature: Some(temperature.to_string()),
            model: Some("llama3".into()),
            backend: Some("ollama".into()),
            ..RunView::default()
        }
    }

    fn render(f: impl Fn(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_run_view_from_stored_run() {
        let stored = Run {
            run_id: "0123456789abcdef".into(),
            run_name: Some("chat-request".into()),
            status: Some(RunStatus::Finished),
            start_time: 1,
            params: BTreeMap::from([
                ("temperature".to_string(), "0.7".to_string()),
                ("model".to_string(), "llama3".to_string()),
            ]),
            metrics: BTreeMap::from([
                ("success".to_string(), 1.0),
                ("output_tokens".to_string(), 12.0),
            ]),
        };
        let view = RunView::from(stored);
        assert!(view.succeeded());
        assert_eq!(view.temperature_value(), Some(0.7));
        assert_eq!(view.output_tokens, Some(12.0));
        assert_eq!(view.latency_ms, None);
        assert_eq!(view.model.as_deref(), Some("llama3"));
        assert_eq!(view.backend, None);
    }

    #[test]
    fn test_group_by_temperature_merges_equal_values() {
        let runs = vec![
            run("a", "0.7", 1.0, 100.0, 10.0),
            run("b", "0.2", 1.0, 200.0, 20.0),
            run("c", "0.20", 1.0, 400.0, 40.0),
            run("d", "not-a-number", 1.0, 1.0, 1.0),
        ];
        let groups = group_by_temperature(&runs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].temperature, 0.2);
        assert_eq!(groups[0].runs, 2);
        assert_eq!(groups[0].mean_latency_ms, Some(300.0));
        assert_eq!(groups[0].mean_output_tokens, Some(30.0));
        assert_eq!(groups[1].temperature, 0.7);
        assert_eq!(groups[1].runs, 1);
    }

    #[test]
    fn test_group_means_skip_missing_values() {
        let mut partial = run("a", "1.0", 0.0, 100.0, 0.0);
        partial.tokens_per_second = None;
        partial.latency_ms = None;
        let groups = group_by_temperature(&[partial, run("b", "1", 1.0, 500.0, 10.0)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].runs, 2);
        assert_eq!(groups[0].mean_latency_ms, Some(500.0));
        assert_eq!(groups[0].mean_tokens_per_second, Some(20.0));
    }

    #[test]
    fn test_compare_prints_ascending() {
        let runs = vec![run("a", "0.9", 1.0, 100.0, 10.0), run("b", "0.1", 1.0, 100.0, 10.0)];
        let text = render(|out| compare_by_temperature(&runs, out));
        assert!(text.contains("Tested temperatures: [0.1, 0.9]"));
        let low = text.find("Temperature: 0.1").unwrap();
        let high = text.find("Temperature: 0.9").unwrap();
        assert!(low < high);
    }

    #[test]
    fn test_aggregate_without_successes() {
        let runs = vec![run("a", "0.2", 0.0, 50.0, 0.0)];
        assert_eq!(aggregate(&runs), None);
        assert_eq!(aggregate(&[]), None);
        let text = render(|out| aggregate_stats(&runs, out));
        assert!(text.contains("No successful runs found."));
    }

    #[test]
    fn test_aggregate_stats_values() {
        let runs = vec![
            run("a", "0.2", 1.0, 100.0, 10.0),
            run("b", "0.2", 1.0, 300.0, 30.0),
            run("c", "0.2", 1.0, 200.0, 5.0),
            run("d", "0.2", 1.0, 1000.0, 50.0),
            run("e", "0.2", 0.0, 9999.0, 0.0),
        ];
        let report = aggregate(&runs).unwrap();
        assert_eq!(report.successful_runs, 4);
        let latency = report.latency_ms.unwrap();
        assert_eq!(latency.count, 4);
        assert_eq!(latency.mean, 400.0);
        assert_eq!(latency.median, 250.0);
        assert_eq!(latency.min, 100.0);
        assert_eq!(latency.max, 1000.0);
        assert_eq!(report.output_tokens.unwrap().median, 20.0);

        let text = render(|out| aggregate_stats(&runs, out));
        assert!(text.contains("Based on 4 successful runs"));
        assert!(text.contains("Median: 250ms"));
    }

    #[test]
    fn test_stats_odd_count_median() {
        let s = stats(&[3.0, 1.0, 2.0]).unwrap();
        assert_eq!(s.median, 2.0);
        assert_eq!(s.mean, 2.0);
        assert_eq!(stats(&[]), None);
    }

    #[test]
    fn test_summarize_tolerates_missing_fields() {
        let sparse = RunView {
            run_id: "abcdef0123456789".into(),
            success: Some(0.0),
            ..RunView::default()
        };
        let full = run("fedcba9876543210", "0.2", 1.0, 500.0, 10.0);
        let runs = [full, sparse];
        let text = render(|out| summarize(&runs, out));

        assert!(text.contains("Total runs: 2"));
        assert!(text.contains("✅ Run 1: chat-request"));
        assert!(text.contains("Total tokens:  12"));
        assert!(text.contains("Throughput:    20.00 tokens/sec"));
        assert!(text.contains("❌ Run 2"));
        assert!(text.contains("Run ID:        abcdef01"));
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/runs_export.csv");

        let mut odd_model = run("r2", "0.7", 0.0, 20.0, 0.0);
        odd_model.model = Some("org/model,\"v2\"".into());
        odd_model.tokens_per_second = None;
        let runs = vec![run("r1", "0.2", 1.0, 500.0, 10.0), odd_model];

        let written = export_csv(&runs, &path).unwrap();
        assert_eq!(written, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "run_id,latency_ms,latency_sec,success,input_tokens,output_tokens,total_tokens,tokens_per_second,temperature,model"
        );
        assert_eq!(lines[1], "r1,500,0.5,1,2,10,12,20,0.2,llama3");
        assert_eq!(lines[2], "r2,20,0.02,0,2,0,2,,0.7,\"org/model,\"\"v2\"\"\"");
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
