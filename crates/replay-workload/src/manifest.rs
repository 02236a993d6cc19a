//! `connections.json` manifest parsing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use replay_model::{parse_timestamp, ConnectionLog, PacingMode, Protocol, QueryPacing};
use serde::Deserialize;
use tracing::warn;

/// One session record as written by the extraction pipeline.
///
/// Timestamps arrive as strings (nullable); the query-pacing field has been a
/// bool in some capture versions and a string in others, so it is accepted as
/// any JSON value.
#[derive(Debug, Deserialize)]
struct ManifestRecord {
    session_initiation_time: Option<String>,
    disconnection_time: Option<String>,
    application_name: String,
    database_name: String,
    username: String,
    pid: u32,
    time_interval_between_transactions: bool,
    #[serde(default)]
    time_interval_between_queries: serde_json::Value,
}

/// Parse the manifest into filtered connections plus the pre-filter total.
///
/// Records that fail to parse are logged and skipped. Connections are returned
/// sorted by session initiation time (missing times sort first).
pub fn parse_connections(
    manifest_json: &str,
    opts: &crate::LoaderOptions,
) -> Result<(Vec<ConnectionLog>, usize)> {
    let records: Vec<serde_json::Value> =
        serde_json::from_str(manifest_json).context("Failed to parse connections.json")?;

    let mut connections = Vec::new();
    let mut total_connections = 0;

    for raw in records {
        let record: ManifestRecord = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(err) => {
                warn!("Could not parse connection record {raw}: {err}");
                continue;
            }
        };

        let session_initiation_time = match parse_optional_time(
            record.session_initiation_time.as_deref(),
            "session_initiation_time",
            &record,
        ) {
            Ok(t) => t,
            Err(()) => continue,
        };
        let disconnection_time = match parse_optional_time(
            record.disconnection_time.as_deref(),
            "disconnection_time",
            &record,
        ) {
            Ok(t) => t,
            Err(()) => continue,
        };

        total_connections += 1;

        if !opts
            .filters
            .matches_fields(&record.database_name, &record.username, record.pid)
        {
            continue;
        }

        // With no run-level override, a captured "all on"/"all off" string on
        // the connection record forces pacing; any other value (older captures
        // wrote a bool) defers to the per-transaction flag.
        let query_pacing = match opts.query_pacing {
            PacingMode::AllOn => QueryPacing::On,
            PacingMode::AllOff => QueryPacing::Off,
            PacingMode::AsCaptured => match record.time_interval_between_queries.as_str() {
                Some("all on") => QueryPacing::On,
                Some("all off") => QueryPacing::Off,
                _ => QueryPacing::AsCaptured,
            },
        };

        connections.push(ConnectionLog {
            session_initiation_time,
            disconnection_time,
            protocol: Protocol::resolve(
                &record.application_name,
                opts.default_protocol,
                opts.odbc_configured,
            ),
            application_name: record.application_name,
            database_name: record.database_name,
            username: record.username,
            pid: record.pid,
            pace_transactions: opts
                .transaction_pacing
                .apply(record.time_interval_between_transactions),
            query_pacing,
            transactions: Vec::new(),
        });
    }

    connections.sort_by_key(|c| c.session_initiation_time.unwrap_or(DateTime::<Utc>::MIN_UTC));

    Ok((connections, total_connections))
}

fn parse_optional_time(
    value: Option<&str>,
    field: &str,
    record: &ManifestRecord,
) -> Result<Option<DateTime<Utc>>, ()> {
    match value {
        None | Some("") => Ok(None),
        Some(s) => match parse_timestamp(s) {
            Ok(t) => Ok(Some(t)),
            Err(err) => {
                warn!(
                    "Could not parse {field} {s:?} for connection {}-{}-{}: {err}",
                    record.database_name, record.username, record.pid
                );
                Err(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replay_model::Filters;

    fn options() -> crate::LoaderOptions {
        crate::LoaderOptions {
            transaction_pacing: PacingMode::AsCaptured,
            query_pacing: PacingMode::AsCaptured,
            default_protocol: Protocol::Psql,
            odbc_configured: false,
            filters: Filters::default(),
        }
    }

    const MANIFEST: &str = r#"[
        {
            "session_initiation_time": "2023-05-01T10:00:05+00:00",
            "disconnection_time": "2023-05-01T10:30:00+00:00",
            "application_name": "etl-loader",
            "database_name": "dev",
            "username": "alice",
            "pid": 1001,
            "time_interval_between_transactions": true,
            "time_interval_between_queries": true
        },
        {
            "session_initiation_time": "2023-05-01T10:00:00+00:00",
            "disconnection_time": null,
            "application_name": "psql",
            "database_name": "dev",
            "username": "bob",
            "pid": 1002,
            "time_interval_between_transactions": false,
            "time_interval_between_queries": "all on"
        }
    ]"#;

    #[test]
    fn test_parse_sorted_by_session_start() {
        let (connections, total) = parse_connections(MANIFEST, &options()).unwrap();
        assert_eq!(total, 2);
        assert_eq!(connections.len(), 2);
        // bob started first
        assert_eq!(connections[0].username, "bob");
        assert_eq!(connections[1].username, "alice");
        assert!(connections[1].pace_transactions);
        assert!(!connections[0].pace_transactions);
        assert!(connections[0].disconnection_time.is_none());
    }

    #[test]
    fn test_pacing_overrides() {
        let mut opts = options();
        opts.transaction_pacing = PacingMode::AllOff;
        opts.query_pacing = PacingMode::AllOn;
        let (connections, _) = parse_connections(MANIFEST, &opts).unwrap();
        assert!(connections.iter().all(|c| !c.pace_transactions));
        assert!(connections
            .iter()
            .all(|c| c.query_pacing == QueryPacing::On));
    }

    #[test]
    fn test_captured_query_pacing_honored_without_override() {
        let (connections, _) = parse_connections(MANIFEST, &options()).unwrap();
        // bob's record carries "all on"; alice's carries a legacy bool
        assert_eq!(connections[0].query_pacing, QueryPacing::On);
        assert_eq!(connections[1].query_pacing, QueryPacing::AsCaptured);
    }

    #[test]
    fn test_filtered_connection_excluded_but_counted() {
        let mut opts = options();
        opts.filters = Filters::from_spec(&replay_model::FilterSpec {
            include: [("username".to_string(), vec!["alice".to_string()])]
                .into_iter()
                .collect(),
            exclude: Default::default(),
        })
        .unwrap();
        let (connections, total) = parse_connections(MANIFEST, &opts).unwrap();
        assert_eq!(total, 2);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].username, "alice");
    }

    #[test]
    fn test_malformed_record_skipped() {
        let manifest = r#"[
            {"pid": "not-a-pid"},
            {
                "session_initiation_time": "2023-05-01T10:00:00+00:00",
                "disconnection_time": null,
                "application_name": "psql",
                "database_name": "dev",
                "username": "bob",
                "pid": 1002,
                "time_interval_between_transactions": false,
                "time_interval_between_queries": false
            }
        ]"#;
        let (connections, total) = parse_connections(manifest, &options()).unwrap();
        assert_eq!(total, 1);
        assert_eq!(connections.len(), 1);
    }

    #[test]
    fn test_protocol_resolved_from_application_name() {
        let (connections, _) = parse_connections(MANIFEST, &options()).unwrap();
        // both resolve to psql: one by substring, one by default fallback
        assert!(connections.iter().all(|c| c.protocol == Protocol::Psql));
    }
}
