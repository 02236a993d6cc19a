//! End-to-end run orchestration: load, rewrite, replay, export.

use crate::config::Config;
use crate::{export, system_tables};
use anyhow::{Context, Result};
use replay_credentials::CredentialRefresher;
use replay_exec::{
    PostgresConnector, ProgressCounters, SchedulerOptions, SessionConnector, SessionOptions,
};
use replay_file::Location;
use replay_model::Protocol;
use replay_rewrite::{ReplacementTable, StatementRewriter};
use replay_workload::{load_workload, LoaderOptions, Workload};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Scopes every exported artifact of one run:
/// `<start-ts>_<target-host>[_<tag>]_<short-id>`.
fn replay_id(config: &Config, target_host: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let tag = match &config.tag {
        Some(tag) => format!("_{tag}"),
        None => String::new(),
    };
    let short_id = uuid::Uuid::new_v4().simple().to_string();
    format!("{timestamp}_{target_host}{tag}_{}", &short_id[..8])
}

pub async fn run(config: &Config, workers_override: Option<usize>) -> Result<()> {
    let endpoint = config.endpoint()?;
    let id = replay_id(config, &endpoint.host);
    info!("Starting replay {id} against {}", config.target_cluster_endpoint);

    let workload_location =
        Location::parse(&config.workload_location).context("invalid workload_location")?;
    let loader_options = LoaderOptions {
        transaction_pacing: config.time_interval_between_transactions,
        query_pacing: config.time_interval_between_queries,
        default_protocol: config.default_protocol()?,
        odbc_configured: config.odbc_driver.is_some(),
        filters: config.filters()?,
    };
    let mut workload = load_workload(&workload_location, &loader_options).await?;
    if workload.connections.is_empty() {
        warn!("No connections retained after filtering; nothing to replay");
        return Ok(());
    }
    info!(
        "Replaying {} connection(s), {} transaction(s), {} quer(ies)",
        workload.connections.len(),
        workload.transaction_count,
        workload.query_count
    );

    rewrite_workload(config, &id, &workload_location, &mut workload).await?;

    let source = config.credentials.source(&config.master_username)?;
    let refresher = CredentialRefresher::new(
        source,
        Duration::from_secs(config.credential_refresh_sec),
    );
    let (credentials, refresher_handle) = refresher.start().await?;

    let connector: Arc<dyn SessionConnector> = Arc::new(PostgresConnector::new(
        endpoint.host.clone(),
        endpoint.port,
        CONNECT_TIMEOUT,
    ));
    let session_options = Arc::new(SessionOptions {
        execute_copy_statements: config.execute_copy_statements,
        execute_unload_statements: config.execute_unload_statements,
        unload_target_configured: config.replay_output.is_some(),
        connection_tolerance_sec: config.connection_tolerance_sec as f64,
        progress: Arc::new(ProgressCounters::default()),
    });
    let scheduler_options = SchedulerOptions {
        workers: workers_override
            .or(config.num_workers)
            .unwrap_or_else(replay_exec::default_worker_count),
        idle_timeout: Duration::from_secs(config.empty_queue_timeout_sec),
        timing_dir: config.timing_log_dir.clone(),
        ..Default::default()
    };
    info!("Dispatching to {} worker task(s)", scheduler_options.workers);

    let first_event = workload
        .first_event_time
        .context("retained workload has no first event time")?;
    let connections_replayed = workload.connections.len();
    let stats = replay_exec::run_replay(
        workload.connections,
        first_event,
        connector.clone(),
        credentials.clone(),
        session_options,
        scheduler_options,
    )
    .await?;

    if let Some(queries_file) = &config.unload_system_table_queries {
        // Validation guarantees output and role are present here.
        if let (Some(output), Some(role)) = (&config.replay_output, &config.unload_iam_role) {
            let contents = workload_location
                .join(queries_file)
                .read_to_string()
                .await
                .with_context(|| format!("failed to read system table queries {queries_file}"))?;
            system_tables::export_system_tables(
                connector.as_ref(),
                &credentials,
                &endpoint.database,
                &contents,
                output,
                &id,
                role,
            )
            .await?;
        }
    }
    refresher_handle.stop();

    let error_root =
        Location::parse(config.error_location()).context("invalid error_location")?;
    export::export_errors(&stats, &error_root, &id).await?;
    let summary = export::RunSummary::new(&id, connections_replayed, &stats);
    export::write_summary(&summary, &error_root).await?;

    info!(
        "Replay {id} finished: {}/{} transactions ({:.1}%) and {}/{} queries ({:.1}%) succeeded, \
         {} connection error(s), max start drift {:.2}s",
        summary.transaction_success,
        stats.transaction_total(),
        summary.transaction_success_pct,
        summary.query_success,
        stats.query_total(),
        summary.query_success_pct,
        summary.connection_errors,
        stats.connection_diff_sec,
    );
    Ok(())
}

/// Apply all statement rewrites before anything is scheduled.
async fn rewrite_workload(
    config: &Config,
    id: &str,
    workload_location: &Location,
    workload: &mut Workload,
) -> Result<()> {
    let rewriter = StatementRewriter::new()?;

    if config.execute_copy_statements {
        let replacements = match workload_location
            .join("copy_replacements.csv")
            .read_to_string()
            .await
        {
            Ok(contents) => ReplacementTable::parse_csv(&contents)?,
            Err(e) => {
                warn!("No readable copy_replacements.csv, COPY paths stay as captured: {e:#}");
                ReplacementTable::default()
            }
        };
        rewriter.apply_copy_replacements(&mut workload.connections, &replacements)?;
    }

    if config.execute_unload_statements {
        if let (Some(output), Some(role)) = (&config.replay_output, &config.unload_iam_role) {
            rewriter.apply_unload_rewrites(&mut workload.connections, output, id, role);
        }
    }

    rewriter.assign_create_user_passwords(&mut workload.connections);

    let odbc_sessions = workload
        .connections
        .iter()
        .filter(|c| c.protocol == Protocol::Odbc)
        .count();
    if odbc_sessions > 0 {
        info!("{odbc_sessions} captured odbc session(s) will replay over the native wire");
    }
    Ok(())
}
