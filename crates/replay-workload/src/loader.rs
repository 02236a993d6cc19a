//! Workload assembly: manifest + statement files → replayable connections.

use crate::statements::parse_statement_file;
use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use replay_file::Location;
use replay_model::{ConnectionLog, Filters, PacingMode, Protocol, Transaction};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Options for a load: pacing overrides, protocol defaults, filters.
pub struct LoaderOptions {
    /// Override for inter-transaction (and disconnect) pacing
    pub transaction_pacing: PacingMode,
    /// Override for inter-query pacing
    pub query_pacing: PacingMode,
    /// Protocol for sessions whose `application_name` names neither driver
    pub default_protocol: Protocol,
    /// Whether an ODBC driver name is configured for this run
    pub odbc_configured: bool,
    pub filters: Filters,
}

/// A fully loaded workload, ready for rewriting and scheduling.
pub struct Workload {
    /// Connections that passed the filters and own at least one transaction,
    /// sorted by session initiation time.
    pub connections: Vec<ConnectionLog>,
    /// Connection count in the manifest before filtering
    pub total_connections: usize,
    pub transaction_count: usize,
    pub query_count: usize,
    /// Minimum of all session starts and query starts; `None` when nothing
    /// was retained.
    pub first_event_time: Option<DateTime<Utc>>,
    /// Maximum of all disconnections and query ends
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Load a workload from a local directory or S3 prefix.
///
/// Reads `connections.json` and every `SQLs/*.sql` statement file, associates
/// each transaction with the most recent connection whose session start does
/// not postdate the transaction's first query, prunes connections left with no
/// transactions, and derives inter-query pacing intervals.
pub async fn load_workload(location: &Location, opts: &LoaderOptions) -> Result<Workload> {
    let manifest_json = location
        .join("connections.json")
        .read_to_string()
        .await
        .with_context(|| format!("Failed to read connection manifest from {location}"))?;
    let (mut connections, total_connections) = crate::parse_connections(&manifest_json, opts)?;
    info!(
        "Found {} total connections, {} excluded by filters",
        total_connections,
        total_connections - connections.len()
    );

    let transactions = load_transactions(location, opts).await?;
    let transaction_count = transactions.len();

    let query_count = associate_transactions(&mut connections, transactions);
    info!("Found {transaction_count} transactions, {query_count} queries");

    connections.retain(|c| !c.transactions.is_empty());
    info!(
        "{} connections contain transactions and will be replayed",
        connections.len()
    );

    let (first_event_time, last_event_time) = event_bounds(&connections);

    // a session still open when the capture window closed disconnects at the
    // end of the workload
    if let Some(last) = last_event_time {
        for connection in &mut connections {
            connection.disconnection_time.get_or_insert(last);
        }
    }

    assign_query_intervals(&mut connections);

    Ok(Workload {
        connections,
        total_connections,
        transaction_count,
        query_count,
        first_event_time,
        last_event_time,
    })
}

async fn load_transactions(
    location: &Location,
    opts: &LoaderOptions,
) -> Result<Vec<Transaction>> {
    let sql_dir = location.join("SQLs");
    let files = sql_dir
        .list()
        .await
        .with_context(|| format!("Failed to list statement files under {sql_dir}"))?;

    let mut transactions = Vec::new();
    for file in files {
        let Some(filename) = file.file_name().map(str::to_string) else {
            continue;
        };
        if !filename.ends_with(".sql") {
            continue;
        }
        let contents = file.read_to_string().await?;
        match parse_statement_file(&filename, &contents) {
            Ok(transaction) => {
                if opts.filters.matches_fields(
                    &transaction.database_name,
                    &transaction.username,
                    transaction.pid,
                ) {
                    transactions.push(transaction);
                }
            }
            Err(err) => warn!("Skipping malformed statement file: {err}"),
        }
    }

    transactions.sort_by_key(|t| (t.start_time(), t.xid));
    Ok(transactions)
}

/// Attach each transaction to the most recent connection with the same
/// `(database, user, pid)` whose session start does not postdate the
/// transaction's first query. Returns the total query count attached.
///
/// Session starts are truncated to whole seconds before the comparison because
/// query timestamps in older captures carry only second precision.
fn associate_transactions(
    connections: &mut [ConnectionLog],
    transactions: Vec<Transaction>,
) -> usize {
    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, connection) in connections.iter().enumerate() {
        by_key.entry(connection.key()).or_default().push(idx);
    }

    let mut query_count = 0;
    for transaction in transactions {
        let Some(candidates) = by_key.get(&transaction.connection_key()) else {
            warn!(
                "No connection with key {} for transaction {}, skipping",
                transaction.connection_key(),
                transaction.base_filename()
            );
            continue;
        };

        // candidates are in session-start order because `connections` is sorted
        let mut best_match = None;
        for &idx in candidates {
            let starts_after = connections[idx]
                .session_initiation_time
                .map(truncate_to_seconds)
                .is_some_and(|start| start > transaction.start_time());
            if starts_after {
                break;
            }
            best_match = Some(idx);
        }

        match best_match {
            Some(idx) => {
                let connection = &mut connections[idx];
                if connection
                    .disconnection_time
                    .is_some_and(|end| transaction.start_time() > end)
                {
                    // keep the original attachment rule; see DESIGN.md
                    debug!(
                        "Transaction {} starts after its connection's recorded disconnection",
                        transaction.base_filename()
                    );
                }
                query_count += transaction.queries.len();
                connection.transactions.push(transaction);
            }
            None => warn!(
                "Couldn't find matching connection among {} candidates for transaction {}, skipping",
                candidates.len(),
                transaction.base_filename()
            ),
        }
    }

    query_count
}

fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0).unwrap_or(t)
}

/// `(first_event_time, last_event_time)` over the retained connections.
fn event_bounds(connections: &[ConnectionLog]) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let mut first: Option<DateTime<Utc>> = None;
    let mut last: Option<DateTime<Utc>> = None;

    let mut fold_first = |t: DateTime<Utc>| {
        first = Some(first.map_or(t, |f| f.min(t)));
    };
    let mut fold_last = |t: DateTime<Utc>| {
        last = Some(last.map_or(t, |l| l.max(t)));
    };

    for connection in connections {
        if let Some(t) = connection.session_initiation_time {
            fold_first(t);
        }
        if let Some(t) = connection.disconnection_time {
            fold_last(t);
        }
        if let Some(t) = connection.transactions.first().map(|t| t.start_time()) {
            fold_first(t);
        }
        if let Some(t) = connection.transactions.last().map(|t| t.end_time()) {
            fold_last(t);
        }
    }

    (first, last)
}

/// Derive each query's wait-after interval from the gap to the next query's
/// captured start, for transactions whose effective pacing is on.
fn assign_query_intervals(connections: &mut [ConnectionLog]) {
    for connection in connections.iter_mut() {
        let pacing = connection.query_pacing;
        for transaction in &mut connection.transactions {
            if !pacing.paces(transaction) {
                continue;
            }
            for i in 1..transaction.queries.len() {
                let gap = (transaction.queries[i].start_time - transaction.queries[i - 1].end_time)
                    .num_milliseconds() as f64
                    / 1000.0;
                transaction.queries[i - 1].time_interval = gap.max(0.0);
            }
        }
    }
}
