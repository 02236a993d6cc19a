use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Per-worker CSV log of query wall-clock timings, for offline analysis.
///
/// Shared by every session the worker runs, so writes go through a mutex.
/// Timing rows are best-effort; a failed write is logged and dropped rather
/// than failing the session.
pub struct TimingLog {
    writer: Mutex<csv::Writer<File>>,
}

impl TimingLog {
    pub fn create(dir: &Path, worker_id: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create timing log directory {}", dir.display()))?;
        let path = dir.join(format!("worker-{worker_id}-timings.csv"));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("failed to create timing log {}", path.display()))?;
        writer.write_record([
            "connection_key",
            "xid",
            "query_index",
            "start_offset_sec",
            "elapsed_sec",
            "status",
        ])?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn record(
        &self,
        connection_key: &str,
        xid: u64,
        query_index: usize,
        start_offset_sec: f64,
        elapsed_sec: f64,
        ok: bool,
    ) {
        let row = [
            connection_key.to_string(),
            xid.to_string(),
            query_index.to_string(),
            format!("{start_offset_sec:.3}"),
            format!("{elapsed_sec:.3}"),
            if ok { "ok" } else { "error" }.to_string(),
        ];
        let result = match self.writer.lock() {
            Ok(mut writer) => writer.write_record(&row).and_then(|()| Ok(writer.flush()?)),
            Err(poisoned) => {
                warn!("timing log mutex poisoned, dropping row");
                drop(poisoned);
                return;
            }
        };
        if let Err(e) = result {
            warn!("failed to append timing row: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_records_rows_with_header() {
        let dir = TempDir::new().unwrap();
        let log = TimingLog::create(dir.path(), 3).unwrap();
        log.record("dev-alice-1", 42, 0, 0.5, 0.012, true);
        log.record("dev-alice-1", 42, 1, 1.5, 0.100, false);

        let contents =
            std::fs::read_to_string(dir.path().join("worker-3-timings.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("connection_key,"));
        assert!(lines[1].contains("dev-alice-1,42,0,0.500,0.012,ok"));
        assert!(lines[2].contains("error"));
    }
}
