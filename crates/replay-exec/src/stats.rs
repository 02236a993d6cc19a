use serde::Serialize;
use std::collections::HashMap;

/// A single failed statement, kept for the per-transaction error export.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueryError {
    pub sql: String,
    pub error: String,
}

/// Counters and error logs for one worker (or one session, before the worker
/// folds it in).
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReplayStats {
    /// Largest observed drift between a session's scheduled and actual start,
    /// in seconds. Sign is kept from the worst offender.
    pub connection_diff_sec: f64,
    pub transaction_success: u64,
    pub transaction_error: u64,
    pub query_success: u64,
    pub query_error: u64,
    /// Queries actually sent to the target, excluding gated-out COPY/UNLOAD.
    pub executed_queries: u64,
    /// Session key (`db-user-pid`) to the error that ended the session.
    pub connection_error_log: HashMap<String, String>,
    /// Transaction key (`db-user-pid-xid`) to the statements that failed in it.
    pub transaction_error_log: HashMap<String, Vec<QueryError>>,
}

impl ReplayStats {
    /// Fold another stats block into this one. Used both by workers absorbing
    /// finished sessions and by the coordinator absorbing finished workers.
    pub fn merge(&mut self, other: ReplayStats) {
        if other.connection_diff_sec.abs() > self.connection_diff_sec.abs() {
            self.connection_diff_sec = other.connection_diff_sec;
        }
        self.transaction_success += other.transaction_success;
        self.transaction_error += other.transaction_error;
        self.query_success += other.query_success;
        self.query_error += other.query_error;
        self.executed_queries += other.executed_queries;
        self.connection_error_log.extend(other.connection_error_log);
        self.transaction_error_log.extend(other.transaction_error_log);
    }

    pub fn query_total(&self) -> u64 {
        self.query_success + self.query_error
    }

    pub fn transaction_total(&self) -> u64 {
        self.transaction_success + self.transaction_error
    }
}
