//! Error files and the run summary, written locally or to object storage.

use anyhow::{Context, Result};
use replay_exec::ReplayStats;
use replay_file::Location;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub replay_id: String,
    pub connections_replayed: usize,
    pub connection_errors: usize,
    pub transaction_success: u64,
    pub transaction_error: u64,
    pub transaction_success_pct: f64,
    pub query_success: u64,
    pub query_error: u64,
    pub query_success_pct: f64,
    pub executed_queries: u64,
    pub connection_diff_sec: f64,
}

impl RunSummary {
    pub fn new(replay_id: &str, connections_replayed: usize, stats: &ReplayStats) -> Self {
        Self {
            replay_id: replay_id.to_string(),
            connections_replayed,
            connection_errors: stats.connection_error_log.len(),
            transaction_success: stats.transaction_success,
            transaction_error: stats.transaction_error,
            transaction_success_pct: percentage(stats.transaction_success, stats.transaction_total()),
            query_success: stats.query_success,
            query_error: stats.query_error,
            query_success_pct: percentage(stats.query_success, stats.query_total()),
            executed_queries: stats.executed_queries,
            connection_diff_sec: stats.connection_diff_sec,
        }
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

/// Write one `.txt` per failed connection and per failing transaction under
/// `<root>/<replay_id>/{connection_errors,transaction_errors}/`.
pub async fn export_errors(stats: &ReplayStats, root: &Location, replay_id: &str) -> Result<()> {
    let run_root = root.join(replay_id);

    let connection_dir = run_root.join("connection_errors");
    for (key, error) in &stats.connection_error_log {
        connection_dir
            .join(&format!("{key}.txt"))
            .write(error.as_bytes())
            .await
            .with_context(|| format!("failed to export connection error for {key}"))?;
    }

    let transaction_dir = run_root.join("transaction_errors");
    for (key, failures) in &stats.transaction_error_log {
        let mut body = String::new();
        for failure in failures {
            body.push_str(&failure.sql);
            body.push_str("\nError: ");
            body.push_str(&failure.error);
            body.push_str("\n\n");
        }
        transaction_dir
            .join(&format!("{key}.txt"))
            .write(body.as_bytes())
            .await
            .with_context(|| format!("failed to export transaction errors for {key}"))?;
    }

    info!(
        "Exported {} connection error file(s) and {} transaction error file(s) to {}",
        stats.connection_error_log.len(),
        stats.transaction_error_log.len(),
        run_root
    );
    Ok(())
}

/// Write `summary.json` under `<root>/<replay_id>/`.
pub async fn write_summary(summary: &RunSummary, root: &Location) -> Result<()> {
    let body = serde_json::to_vec_pretty(summary).context("failed to serialize run summary")?;
    root.join(&summary.replay_id)
        .join("summary.json")
        .write(&body)
        .await
        .context("failed to write run summary")
}
