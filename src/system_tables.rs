//! Post-run snapshot of system tables, exported via UNLOAD from the master
//! session.
//!
//! The queries file groups statements into blocks, each introduced by a
//! comment line naming the table:
//!
//! ```text
//! --stl_query
//! unload ($$ select * from stl_query $$) to '' credentials '' parallel off;
//! ```
//!
//! Destinations and credential clauses are left blank in the file and filled
//! in per run.

use anyhow::{Context, Result};
use replay_credentials::CredentialsRx;
use replay_exec::SessionConnector;
use tracing::{info, warn};

#[derive(Debug, PartialEq, Eq)]
pub struct SystemTableQuery {
    pub table_name: String,
    pub sql: String,
}

/// Split the queries file into named blocks. Lines before the first marker
/// are ignored; empty blocks are dropped.
pub fn parse_queries_file(contents: &str) -> Vec<SystemTableQuery> {
    let mut queries = Vec::new();
    let mut table_name: Option<String> = None;
    let mut sql = String::new();

    for line in contents.lines() {
        if let Some(name) = line.strip_prefix("--") {
            flush(&mut queries, table_name.take(), &mut sql);
            table_name = Some(name.trim().to_string());
        } else if table_name.is_some() {
            sql.push_str(line);
            sql.push('\n');
        }
    }
    flush(&mut queries, table_name, &mut sql);
    queries
}

fn flush(queries: &mut Vec<SystemTableQuery>, table_name: Option<String>, sql: &mut String) {
    if let Some(table_name) = table_name {
        let text = std::mem::take(sql);
        let text = text.trim();
        if !text.is_empty() {
            queries.push(SystemTableQuery {
                table_name,
                sql: text.to_string(),
            });
        }
    } else {
        sql.clear();
    }
}

/// Fill in the blank destination and credential clauses for one table's
/// UNLOAD.
pub fn prepare_unload(
    query: &SystemTableQuery,
    output_root: &str,
    replay_id: &str,
    role: &str,
) -> String {
    let destination = format!(
        "{}/{replay_id}/system_tables/{}/",
        output_root.trim_end_matches('/'),
        query.table_name
    );
    let role_clause = format!("IAM_ROLE '{role}'");
    query
        .sql
        .replace("to ''", &format!("to '{destination}'"))
        .replace("TO ''", &format!("TO '{destination}'"))
        .replace("credentials ''", &role_clause)
        .replace("CREDENTIALS ''", &role_clause)
        .replace("iam_role ''", &role_clause)
        .replace("IAM_ROLE ''", &role_clause)
}

/// Run every snapshot UNLOAD through a fresh master session. Individual
/// failures are logged and skipped; only the inability to connect is fatal.
pub async fn export_system_tables(
    connector: &dyn SessionConnector,
    credentials: &CredentialsRx,
    database: &str,
    queries_file: &str,
    output_root: &str,
    replay_id: &str,
    role: &str,
) -> Result<()> {
    let queries = parse_queries_file(queries_file);
    if queries.is_empty() {
        warn!("system table queries file contained no query blocks");
        return Ok(());
    }

    let creds = credentials.borrow().clone();
    let mut session = connector
        .connect(database, &creds)
        .await
        .context("failed to open the system table export session")?;

    let mut exported = 0;
    for query in &queries {
        let sql = prepare_unload(query, output_root, replay_id, role);
        match session.execute(&sql).await {
            Ok(()) => exported += 1,
            Err(e) => warn!(table = %query.table_name, "system table export failed: {e:#}"),
        }
    }
    let _ = session.close().await;
    info!("Exported {exported}/{} system table snapshot(s)", queries.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERIES_FILE: &str = "\
--stl_query
unload ($$ select * from stl_query $$) to '' credentials '' parallel off;
--stl_wlm_query
unload ($$ select * from stl_wlm_query $$)
to '' IAM_ROLE '' parallel off;
";

    #[test]
    fn test_parse_blocks() {
        let queries = parse_queries_file(QUERIES_FILE);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].table_name, "stl_query");
        assert!(queries[0].sql.contains("from stl_query"));
        assert_eq!(queries[1].table_name, "stl_wlm_query");
        assert!(queries[1].sql.contains("IAM_ROLE ''"));
    }

    #[test]
    fn test_parse_ignores_preamble_and_empty_blocks() {
        let queries = parse_queries_file("select 1;\n--empty_table\n--real\nselect 2;\n");
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].table_name, "real");
    }

    #[test]
    fn test_prepare_unload_fills_destination_and_role() {
        let queries = parse_queries_file(QUERIES_FILE);
        let sql = prepare_unload(&queries[0], "s3://bucket/out/", "run-1", "role-arn");
        assert!(sql.contains("to 's3://bucket/out/run-1/system_tables/stl_query/'"), "{sql}");
        assert!(sql.contains("IAM_ROLE 'role-arn'"), "{sql}");
        assert!(!sql.contains("credentials ''"), "{sql}");

        let sql = prepare_unload(&queries[1], "s3://bucket/out", "run-1", "role-arn");
        assert!(sql.contains("to 's3://bucket/out/run-1/system_tables/stl_wlm_query/'"), "{sql}");
        assert!(sql.contains("IAM_ROLE 'role-arn'"), "{sql}");
    }
}
