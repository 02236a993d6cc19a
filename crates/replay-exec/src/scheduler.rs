//! The worker pool that drains the connection queue.

use crate::session::{
    ConnectionExecutor, SessionConnector, SessionOptions, Timeline,
};
use crate::stats::ReplayStats;
use crate::timing::TimingLog;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use replay_credentials::CredentialsRx;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// One unit of work on the queue. Each worker receives exactly one `Shutdown`
/// sentinel once every connection has been enqueued.
pub enum Job {
    Connection(Box<replay_model::ConnectionLog>),
    Shutdown,
}

pub struct SchedulerOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long one dequeue attempt blocks before the worker re-checks its
    /// idle budget.
    pub poll_timeout: Duration,
    /// A worker idle longer than this gives up and returns its stats.
    pub idle_timeout: Duration,
    /// Directory for the per-worker query timing CSVs; disabled when unset.
    pub timing_dir: Option<PathBuf>,
    /// Cadence of the coordinator's progress log line.
    pub progress_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            queue_capacity: 10_000,
            poll_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            timing_dir: None,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// One core is left for the coordinator and the runtime's own work.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Replay every connection and return the aggregated stats.
///
/// Connections are enqueued in capture order onto a bounded queue shared by
/// `options.workers` tasks; the executors themselves wait for their scheduled
/// offsets, so enqueue order only matters for fairness. Ctrl-C stops further
/// enqueues, discards already-queued sessions, and lets in-flight sessions
/// finish.
pub async fn run_replay(
    connections: Vec<replay_model::ConnectionLog>,
    first_event: DateTime<Utc>,
    connector: Arc<dyn SessionConnector>,
    credentials: CredentialsRx,
    session_options: Arc<SessionOptions>,
    options: SchedulerOptions,
) -> Result<ReplayStats> {
    if connections.is_empty() {
        return Ok(ReplayStats::default());
    }

    let (tx, rx) = mpsc::channel(options.queue_capacity);
    let shared_rx: SharedReceiver = Arc::new(Mutex::new(rx));
    let active_workers = Arc::new(AtomicUsize::new(options.workers));
    let interrupt = Arc::new(AtomicBool::new(false));
    let timeline = Timeline::start(first_event);

    let mut workers = JoinSet::new();
    for worker_id in 0..options.workers {
        let timing = match &options.timing_dir {
            Some(dir) => Some(Arc::new(
                TimingLog::create(dir, worker_id).context("failed to create timing log")?,
            )),
            None => None,
        };
        workers.spawn(worker_loop(
            worker_id,
            shared_rx.clone(),
            connector.clone(),
            credentials.clone(),
            timeline.clone(),
            session_options.clone(),
            options.poll_timeout,
            options.idle_timeout,
            active_workers.clone(),
            interrupt.clone(),
            timing,
        ));
    }

    let progress = session_options.progress.clone();
    let progress_interval = options.progress_interval;
    let reporter = tokio::spawn(async move {
        let mut timer = tokio::time::interval(progress_interval);
        timer.tick().await;
        loop {
            timer.tick().await;
            let (queries, errors) = progress.snapshot();
            if queries > 0 {
                let pct = 100.0 * (queries - errors) as f64 / queries as f64;
                info!("progress: {queries} queries replayed, {pct:.1}% successful");
            }
        }
    });

    let total = connections.len();
    let mut submitted = 0usize;
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    for connection in connections {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupt received, queued sessions will be discarded");
                interrupt.store(true, Ordering::SeqCst);
                interrupted = true;
            }
            result = put_and_retry(&tx, Job::Connection(Box::new(connection)), &active_workers) => {
                result?;
                submitted += 1;
            }
        }
        if interrupted {
            break;
        }
    }
    debug!("submitted {submitted}/{total} sessions");

    if !interrupted {
        for _ in 0..options.workers {
            put_and_retry(&tx, Job::Shutdown, &active_workers).await?;
        }
    }
    // Closing the channel lets workers fall through once the queue drains,
    // covering the interrupted case where no sentinels were sent.
    drop(tx);

    let mut stats = ReplayStats::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(worker_stats) => stats.merge(worker_stats),
            Err(e) => warn!("worker task failed: {e}"),
        }
    }
    reporter.abort();

    Ok(stats)
}

/// Enqueue with indefinite retry on a full queue. Aborts when every worker
/// has already exited, since nothing would ever drain the job.
pub(crate) async fn put_and_retry(
    tx: &mpsc::Sender<Job>,
    mut job: Job,
    active_workers: &AtomicUsize,
) -> Result<()> {
    loop {
        if active_workers.load(Ordering::SeqCst) == 0 {
            anyhow::bail!("all workers exited while the queue was full; aborting submission");
        }
        match tx.send_timeout(job, Duration::from_secs(1)).await {
            Ok(()) => return Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(returned)) => {
                debug!("job queue full, retrying");
                job = returned;
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                anyhow::bail!("job queue closed before submission finished");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn worker_loop(
    worker_id: usize,
    shared_rx: SharedReceiver,
    connector: Arc<dyn SessionConnector>,
    credentials: CredentialsRx,
    timeline: Timeline,
    session_options: Arc<SessionOptions>,
    poll_timeout: Duration,
    idle_timeout: Duration,
    active_workers: Arc<AtomicUsize>,
    interrupt: Arc<AtomicBool>,
    timing: Option<Arc<TimingLog>>,
) -> ReplayStats {
    let mut stats = ReplayStats::default();
    let mut sessions: JoinSet<ReplayStats> = JoinSet::new();
    let mut idle = Duration::ZERO;

    loop {
        // Fold in whatever sessions finished since the last pass.
        while let Some(finished) = sessions.try_join_next() {
            match finished {
                Ok(session_stats) => stats.merge(session_stats),
                Err(e) => warn!(worker_id, "session task failed: {e}"),
            }
        }

        let received = {
            let mut rx = shared_rx.lock().await;
            tokio::time::timeout(poll_timeout, rx.recv()).await
        };
        match received {
            Err(_) => {
                idle += poll_timeout;
                if idle >= idle_timeout {
                    info!(worker_id, "queue empty for {:?}, stopping", idle_timeout);
                    break;
                }
            }
            Ok(None) => break,
            Ok(Some(Job::Shutdown)) => {
                debug!(worker_id, "shutdown sentinel received");
                break;
            }
            Ok(Some(Job::Connection(connection))) => {
                idle = Duration::ZERO;
                // After an interrupt, queued sessions are pulled off and
                // dropped so the channel empties without replaying them.
                if interrupt.load(Ordering::SeqCst) {
                    debug!(worker_id, connection = %connection.key(), "discarding queued session");
                    continue;
                }
                let executor = ConnectionExecutor::new(
                    *connection,
                    connector.clone(),
                    credentials.clone(),
                    timeline.clone(),
                    session_options.clone(),
                    timing.clone(),
                );
                sessions.spawn(executor.run());
            }
        }
    }

    while let Some(finished) = sessions.join_next().await {
        match finished {
            Ok(session_stats) => stats.merge(session_stats),
            Err(e) => warn!(worker_id, "session task failed: {e}"),
        }
    }
    active_workers.fetch_sub(1, Ordering::SeqCst);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{connection, credentials_rx, ts, MockConnector};
    use replay_model::QueryPacing;

    #[tokio::test(start_paused = true)]
    async fn test_stats_cover_every_query() {
        let connector = MockConnector::new();
        let mut connections = Vec::new();
        for _ in 0..3 {
            connections.push(connection(
                &["SELECT 1;", "SELECT FAIL_ME;", "SELECT 3;"],
                false,
                QueryPacing::Off,
            ));
        }
        let total_queries: u64 = connections
            .iter()
            .flat_map(|c| &c.transactions)
            .map(|t| t.queries.len() as u64)
            .sum();

        let stats = run_replay(
            connections,
            ts(0),
            connector,
            credentials_rx(),
            Arc::new(SessionOptions::default()),
            SchedulerOptions {
                workers: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.query_success + stats.query_error, total_queries);
        assert_eq!(stats.query_error, 3);
        assert_eq!(stats.transaction_error, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_times_out() {
        let (tx, rx) = mpsc::channel::<Job>(8);
        let shared: SharedReceiver = Arc::new(Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(1));

        let stats = worker_loop(
            0,
            shared,
            MockConnector::new(),
            credentials_rx(),
            Timeline::start(ts(0)),
            Arc::new(SessionOptions::default()),
            Duration::from_secs(10),
            Duration::from_secs(120),
            active.clone(),
            Arc::new(AtomicBool::new(false)),
            None,
        )
        .await;

        // The sender is still open, so the worker stopped on idle budget
        // alone.
        drop(tx);
        assert_eq!(stats.query_total(), 0);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_discards_queued_sessions() {
        let connector = MockConnector::new();
        let (tx, rx) = mpsc::channel::<Job>(8);
        for _ in 0..3 {
            tx.send(Job::Connection(Box::new(connection(
                &["SELECT 1;"],
                false,
                QueryPacing::Off,
            ))))
            .await
            .unwrap();
        }
        drop(tx);

        let stats = worker_loop(
            0,
            Arc::new(Mutex::new(rx)),
            connector.clone(),
            credentials_rx(),
            Timeline::start(ts(0)),
            Arc::new(SessionOptions::default()),
            Duration::from_secs(10),
            Duration::from_secs(120),
            Arc::new(AtomicUsize::new(1)),
            Arc::new(AtomicBool::new(true)),
            None,
        )
        .await;

        // Every queued session was pulled off and dropped unexecuted.
        assert!(connector.statements().is_empty());
        assert_eq!(stats.query_total(), 0);
        assert_eq!(stats.transaction_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_and_retry_aborts_with_no_workers() {
        let (tx, _rx) = mpsc::channel::<Job>(1);
        let active = AtomicUsize::new(0);
        let result = put_and_retry(&tx, Job::Shutdown, &active).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_surfaces_in_aggregate() {
        let connector = MockConnector::failing();
        let connections = vec![connection(&["SELECT 1;"], false, QueryPacing::Off)];
        let stats = run_replay(
            connections,
            ts(0),
            connector,
            credentials_rx(),
            Arc::new(SessionOptions::default()),
            SchedulerOptions {
                workers: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.connection_error_log.len(), 1);
        assert_eq!(stats.query_total(), 0);
    }
}
