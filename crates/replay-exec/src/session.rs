//! One replayed client session, driven as a state machine.

use crate::stats::{QueryError, ReplayStats};
use crate::timing::TimingLog;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replay_credentials::{CredentialsRx, DbCredentials};
use replay_model::{ConnectionLog, Protocol};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Waits shorter than this are skipped; sleeping for them costs more accuracy
/// than it buys.
const WAIT_THRESHOLD: Duration = Duration::from_millis(10);

/// An open session against the target cluster.
#[async_trait]
pub trait SqlSession: Send {
    async fn execute(&mut self, sql: &str) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions. The production implementation speaks the native wire
/// protocol; tests substitute mocks.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        database: &str,
        credentials: &DbCredentials,
    ) -> Result<Box<dyn SqlSession>>;
}

/// Lifecycle of a replayed session. `Failed` absorbs; every other state
/// advances monotonically to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connecting,
    Authenticated,
    Executing,
    Disconnecting,
    Done,
    Failed,
}

/// Live counters shared by every session, read by the coordinator's progress
/// reporter while workers run.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub queries: AtomicU64,
    pub errors: AtomicU64,
}

impl ProgressCounters {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.queries.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// Knobs shared by all sessions in a run.
pub struct SessionOptions {
    /// Replay COPY statements reading from object storage.
    pub execute_copy_statements: bool,
    /// Replay UNLOAD statements. Requires a rewritten destination, so also
    /// gated on the replay output being configured.
    pub execute_unload_statements: bool,
    pub unload_target_configured: bool,
    /// Warn when a session starts further than this from its scheduled time.
    pub connection_tolerance_sec: f64,
    pub progress: Arc<ProgressCounters>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            execute_copy_statements: true,
            execute_unload_statements: false,
            unload_target_configured: false,
            connection_tolerance_sec: 300.0,
            progress: Arc::new(ProgressCounters::default()),
        }
    }
}

/// Maps capture time onto replay wall-clock time.
///
/// Anchored once when the replay starts; every session derives its waits from
/// the same anchor so relative timing between sessions is preserved.
#[derive(Clone)]
pub struct Timeline {
    replay_start: Instant,
    first_event: DateTime<Utc>,
}

impl Timeline {
    pub fn start(first_event: DateTime<Utc>) -> Self {
        Self {
            replay_start: Instant::now(),
            first_event,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.replay_start.elapsed()
    }

    /// Sleep until the replay-time equivalent of `event`, then return the
    /// drift in seconds (positive when running behind schedule).
    pub async fn wait_until(&self, event: DateTime<Utc>) -> f64 {
        let offset_ms = (event - self.first_event).num_milliseconds().max(0) as u64;
        let target = self.replay_start + Duration::from_millis(offset_ms);
        let now = Instant::now();
        if target > now + WAIT_THRESHOLD {
            tokio::time::sleep_until(target).await;
        }
        let elapsed = Instant::now().duration_since(self.replay_start);
        elapsed.as_secs_f64() - (offset_ms as f64 / 1000.0)
    }
}

/// Drives one [`ConnectionLog`] through connect, impersonation, transaction
/// execution and disconnect.
pub struct ConnectionExecutor {
    connection: ConnectionLog,
    connector: Arc<dyn SessionConnector>,
    credentials: CredentialsRx,
    timeline: Timeline,
    options: Arc<SessionOptions>,
    timing: Option<Arc<TimingLog>>,
    state: SessionState,
}

impl ConnectionExecutor {
    pub fn new(
        connection: ConnectionLog,
        connector: Arc<dyn SessionConnector>,
        credentials: CredentialsRx,
        timeline: Timeline,
        options: Arc<SessionOptions>,
        timing: Option<Arc<TimingLog>>,
    ) -> Self {
        Self {
            connection,
            connector,
            credentials,
            timeline,
            options,
            timing,
            state: SessionState::Pending,
        }
    }

    pub async fn run(mut self) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let key = self.connection.key();
        debug!(connection = %key, "scheduling session: {}", self.connection);

        if let Some(start) = self.connection.session_initiation_time {
            let drift = self.timeline.wait_until(start).await;
            stats.connection_diff_sec = drift;
            if drift.abs() > self.options.connection_tolerance_sec {
                warn!(
                    connection = %key,
                    drift_sec = drift,
                    "session start drifted beyond tolerance"
                );
            }
        }

        self.state = SessionState::Connecting;
        if self.connection.protocol == Protocol::Odbc {
            debug!(connection = %key, "replaying captured odbc session over the native wire");
        }
        let credentials: Arc<DbCredentials> = self.credentials.borrow().clone();
        let mut session = match self
            .connector
            .connect(&self.connection.database_name, &credentials)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(connection = %key, "connection failed: {e:#}");
                self.state = SessionState::Failed;
                stats.connection_error_log.insert(key, format!("{e:#}"));
                return stats;
            }
        };

        self.state = SessionState::Authenticated;
        let captured_user = strip_provider_prefix(&self.connection.username);
        let impersonate = format!("SET SESSION AUTHORIZATION {};", quote_ident(captured_user));
        if let Err(e) = session.execute(&impersonate).await {
            warn!(connection = %key, user = captured_user, "impersonation failed: {e:#}");
            self.state = SessionState::Failed;
            stats.connection_error_log.insert(key, format!("{e:#}"));
            let _ = session.close().await;
            return stats;
        }

        self.state = SessionState::Executing;
        for transaction in &self.connection.transactions {
            let pace_queries = self.connection.query_pacing.paces(transaction);
            if self.connection.pace_transactions {
                self.timeline.wait_until(transaction.start_time()).await;
            }

            let mut failed = false;
            for (index, query) in transaction.queries.iter().enumerate() {
                // Hold each query to its captured offset regardless of pacing;
                // the interval sleep below is a separate, gated step.
                self.timeline.wait_until(query.start_time).await;

                if let Some(gate) = self.gated_reason(&query.text) {
                    debug!(
                        transaction = %transaction.base_filename(),
                        "statement not replayed: {gate}"
                    );
                    stats.query_success += 1;
                    self.options.progress.queries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let started = Instant::now();
                let result = session.execute(&query.text).await;
                let elapsed = started.elapsed();
                if let Some(timing) = &self.timing {
                    timing.record(
                        &transaction.connection_key(),
                        transaction.xid,
                        index,
                        (started - self.timeline.replay_start).as_secs_f64(),
                        elapsed.as_secs_f64(),
                        result.is_ok(),
                    );
                }

                self.options.progress.queries.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(()) => {
                        stats.query_success += 1;
                        stats.executed_queries += 1;
                    }
                    Err(e) => {
                        failed = true;
                        stats.query_error += 1;
                        self.options.progress.errors.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            transaction = %transaction.base_filename(),
                            "query failed: {e:#}"
                        );
                        stats
                            .transaction_error_log
                            .entry(transaction.base_filename())
                            .or_default()
                            .push(QueryError {
                                sql: query.text.clone(),
                                error: format!("{e:#}"),
                            });
                    }
                }

                if pace_queries && query.time_interval > WAIT_THRESHOLD.as_secs_f64() {
                    tokio::time::sleep(Duration::from_secs_f64(query.time_interval)).await;
                }
            }

            // Captured transactions do not carry their own COMMIT; issue one
            // so work is visible to sessions replayed later.
            if let Err(e) = session.execute("COMMIT;").await {
                debug!(transaction = %transaction.base_filename(), "commit failed: {e:#}");
            }

            if failed {
                stats.transaction_error += 1;
            } else {
                stats.transaction_success += 1;
            }
        }

        self.state = SessionState::Disconnecting;
        if self.connection.pace_transactions {
            if let Some(disconnect) = self.connection.disconnection_time {
                self.timeline.wait_until(disconnect).await;
            }
        }
        if let Err(e) = session.close().await {
            debug!(connection = %key, "disconnect failed: {e:#}");
        }

        self.state = SessionState::Done;
        debug!(connection = %key, state = ?self.state, "session finished");
        stats
    }

    /// Why a statement is withheld from the target, if it is.
    fn gated_reason(&self, sql: &str) -> Option<&'static str> {
        let lowered = sql.to_lowercase();
        if lowered.contains("copy ")
            && lowered.contains("from 's3:")
            && !self.options.execute_copy_statements
        {
            return Some("copy execution disabled");
        }
        if lowered.contains("unload") && lowered.contains("to 's3:") {
            if !self.options.execute_unload_statements {
                return Some("unload execution disabled");
            }
            if !self.options.unload_target_configured {
                return Some("no unload target configured");
            }
        }
        None
    }
}

fn strip_provider_prefix(username: &str) -> &str {
    match username.split_once(':') {
        Some((_, name)) => name,
        None => username,
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
