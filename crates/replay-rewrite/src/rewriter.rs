//! In-place rewriting of captured query text.

use crate::table::ReplacementTable;
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;
use replay_model::ConnectionLog;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// A COPY source matched the replacement table but there is no role to
    /// authorize it with. Replaying such a COPY can never succeed, so this is
    /// fatal configuration, not a data problem.
    #[error("COPY replacement for {path} is missing an authorization role; add one to the replacement table or remove the entry")]
    MissingRole { path: String },

    #[error("invalid rewrite pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Compiled rewrite patterns, built once per run.
pub struct StatementRewriter {
    copy_source: Regex,
    unload_dest: Regex,
    create_user_password: Regex,
    /// Blanked-out (or source-environment) credential clauses, each replaced
    /// by the target role
    credential_clauses: Vec<Regex>,
}

impl StatementRewriter {
    pub fn new() -> Result<Self, RewriteError> {
        Ok(Self {
            copy_source: Regex::new(r"(?i)from\s+'(s3://[^']*)'")?,
            unload_dest: Regex::new(r"(?i)to\s+'(s3://[^']*)'")?,
            create_user_password: Regex::new(r"(?i)PASSWORD\s+'\*\*\*'")?,
            credential_clauses: vec![
                Regex::new(r"(?i)IAM_ROLE\s+'arn:aws:iam::\d+:role/\S+'")?,
                Regex::new(r"(?i)with\s+credentials\s+as\s+''")?,
                Regex::new(r"(?i)credentials\s+''")?,
                Regex::new(r"(?i)IAM_ROLE\s+''")?,
                Regex::new(r"(?i)ACCESS_KEY_ID\s+''\s+SECRET_ACCESS_KEY\s+''\s+SESSION_TOKEN\s+''")?,
                Regex::new(r"(?i)ACCESS_KEY_ID\s+''\s+SECRET_ACCESS_KEY\s+''")?,
            ],
        })
    }

    /// Rewrite COPY statements that read from object storage.
    ///
    /// The captured source path keys into the replacement table; unmatched
    /// paths are logged and left untouched (the COPY will be gated or fail at
    /// execution, which is recorded, not fatal).
    pub fn apply_copy_replacements(
        &self,
        connections: &mut [ConnectionLog],
        replacements: &ReplacementTable,
    ) -> Result<(), RewriteError> {
        let mut rewritten = 0;
        for query in queries_mut(connections) {
            let lowered = query.text.to_lowercase();
            if !(lowered.contains("copy ") && lowered.contains("from 's3:")) {
                continue;
            }
            let Some(capture) = self.copy_source.captures(&query.text) else {
                continue;
            };
            let original_path = capture[1].to_string();

            let Some(replacement) = replacements.get(&original_path) else {
                info!("No COPY replacement found for {original_path}");
                continue;
            };
            if replacement.role.is_empty() {
                return Err(RewriteError::MissingRole {
                    path: original_path,
                });
            }

            let new_path = if replacement.path.is_empty() {
                &original_path
            } else {
                &replacement.path
            };
            query.text = query.text.replace(&original_path, new_path);
            self.substitute_credentials(&mut query.text, &replacement.role);
            rewritten += 1;
        }
        debug!("Rewrote {rewritten} COPY statements");
        Ok(())
    }

    /// Retarget UNLOAD destinations under `<output_root>/<replay_name>/UNLOADs/`
    /// and substitute the export authorization role.
    ///
    /// Destinations already under the run's output root are left alone, so
    /// re-applying the rewrite is a no-op.
    pub fn apply_unload_rewrites(
        &self,
        connections: &mut [ConnectionLog],
        output_root: &str,
        replay_name: &str,
        unload_role: &str,
    ) {
        let output_root = output_root.trim_end_matches('/');
        let scoped_prefix = format!("{output_root}/{replay_name}/UNLOADs/");

        let mut rewritten = 0;
        for query in queries_mut(connections) {
            let lowered = query.text.to_lowercase();
            if !(lowered.contains("unload") && lowered.contains("to 's3:")) {
                continue;
            }
            let Some(capture) = self.unload_dest.captures(&query.text) else {
                continue;
            };
            let original_dest = capture[1].to_string();
            if original_dest.starts_with(&scoped_prefix) {
                continue;
            }

            let suffix = original_dest.trim_start_matches("s3://");
            let new_dest = format!("{scoped_prefix}{suffix}");
            query.text = query.text.replace(&original_dest, &new_dest);
            self.substitute_credentials(&mut query.text, unload_role);
            rewritten += 1;
        }
        debug!("Rewrote {rewritten} UNLOAD statements");
    }

    /// Replace `PASSWORD '***'` placeholders in CREATE USER statements with a
    /// fresh random password per occurrence.
    pub fn assign_create_user_passwords(&self, connections: &mut [ConnectionLog]) {
        for query in queries_mut(connections) {
            if !query.text.to_lowercase().contains("create user") {
                continue;
            }
            while self.create_user_password.is_match(&query.text) {
                let replacement = format!("PASSWORD '{}'", generate_password());
                query.text = self
                    .create_user_password
                    .replace(&query.text, replacement.as_str())
                    .into_owned();
            }
        }
    }

    fn substitute_credentials(&self, text: &mut String, role: &str) {
        let clause = format!("IAM_ROLE '{role}'");
        let mut substituted = false;
        for pattern in &self.credential_clauses {
            if pattern.is_match(text) {
                *text = pattern.replace_all(text, clause.as_str()).into_owned();
                substituted = true;
            }
        }
        if !substituted {
            warn!("No credential clause found to substitute in rewritten statement");
        }
    }
}

/// A 64-character random password with guaranteed uppercase, lowercase and
/// digit content.
fn generate_password() -> String {
    let mut password: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(61)
        .map(char::from)
        .collect();
    password.push_str("aA0");
    password
}

fn queries_mut(
    connections: &mut [ConnectionLog],
) -> impl Iterator<Item = &mut replay_model::Query> {
    connections
        .iter_mut()
        .flat_map(|c| c.transactions.iter_mut())
        .flat_map(|t| t.queries.iter_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Replacement;
    use chrono::{TimeZone, Utc};
    use replay_model::{Protocol, Query, QueryPacing, Transaction};

    fn workload_with(text: &str) -> Vec<ConnectionLog> {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        vec![ConnectionLog {
            session_initiation_time: Some(ts),
            disconnection_time: Some(ts),
            application_name: "psql".into(),
            database_name: "dev".into(),
            username: "alice".into(),
            pid: 1,
            pace_transactions: false,
            query_pacing: QueryPacing::Off,
            protocol: Protocol::Psql,
            transactions: vec![Transaction {
                database_name: "dev".into(),
                username: "alice".into(),
                pid: 1,
                xid: 1,
                pacing_flag: false,
                queries: vec![Query::new(ts, ts, text.to_string())],
            }],
        }]
    }

    fn first_text(connections: &[ConnectionLog]) -> &str {
        &connections[0].transactions[0].queries[0].text
    }

    fn table(entries: &[(&str, &str, &str)]) -> ReplacementTable {
        ReplacementTable::from_entries(entries.iter().map(|(orig, path, role)| {
            (
                orig.to_string(),
                Replacement {
                    path: path.to_string(),
                    role: role.to_string(),
                },
            )
        }))
    }

    #[test]
    fn test_copy_path_and_credentials_rewritten() {
        let mut connections =
            workload_with("COPY t FROM 's3://old/path' credentials '' GZIP;");
        let rewriter = StatementRewriter::new().unwrap();
        rewriter
            .apply_copy_replacements(
                &mut connections,
                &table(&[("s3://old/path", "s3://new/path", "role-arn")]),
            )
            .unwrap();
        let text = first_text(&connections);
        assert!(text.contains("'s3://new/path'"), "{text}");
        assert!(text.contains("IAM_ROLE 'role-arn'"), "{text}");
        assert!(!text.contains("credentials ''"), "{text}");
    }

    #[test]
    fn test_copy_rewrite_is_idempotent() {
        let mut connections =
            workload_with("COPY t FROM 's3://old/path' CREDENTIALS '' GZIP;");
        let rewriter = StatementRewriter::new().unwrap();
        let replacements = table(&[("s3://old/path", "s3://new/path", "role-arn")]);

        rewriter
            .apply_copy_replacements(&mut connections, &replacements)
            .unwrap();
        let once = first_text(&connections).to_string();
        rewriter
            .apply_copy_replacements(&mut connections, &replacements)
            .unwrap();
        assert_eq!(first_text(&connections), once);
    }

    #[test]
    fn test_copy_unmatched_path_untouched() {
        let original = "COPY t FROM 's3://unknown/path' credentials '';";
        let mut connections = workload_with(original);
        let rewriter = StatementRewriter::new().unwrap();
        rewriter
            .apply_copy_replacements(
                &mut connections,
                &table(&[("s3://old/path", "s3://new/path", "role-arn")]),
            )
            .unwrap();
        assert_eq!(first_text(&connections), original);
    }

    #[test]
    fn test_copy_missing_role_is_fatal() {
        let mut connections = workload_with("COPY t FROM 's3://old/path' credentials '';");
        let rewriter = StatementRewriter::new().unwrap();
        let err = rewriter
            .apply_copy_replacements(
                &mut connections,
                &table(&[("s3://old/path", "s3://new/path", "")]),
            )
            .unwrap_err();
        assert!(matches!(err, RewriteError::MissingRole { .. }));
    }

    #[test]
    fn test_copy_existing_iam_role_replaced() {
        let mut connections = workload_with(
            "COPY t FROM 's3://old/path' IAM_ROLE 'arn:aws:iam::111:role/source-env';",
        );
        let rewriter = StatementRewriter::new().unwrap();
        rewriter
            .apply_copy_replacements(
                &mut connections,
                &table(&[("s3://old/path", "", "target-role")]),
            )
            .unwrap();
        let text = first_text(&connections);
        assert!(text.contains("IAM_ROLE 'target-role'"), "{text}");
        assert!(text.contains("'s3://old/path'"), "{text}");
    }

    #[test]
    fn test_unload_destination_retargeted() {
        let mut connections =
            workload_with("UNLOAD ('select 1') TO 's3://source/exports/day1' IAM_ROLE '';");
        let rewriter = StatementRewriter::new().unwrap();
        rewriter.apply_unload_rewrites(
            &mut connections,
            "s3://replay-bucket/output",
            "run-2023",
            "unload-role",
        );
        let text = first_text(&connections);
        assert!(
            text.contains("'s3://replay-bucket/output/run-2023/UNLOADs/source/exports/day1'"),
            "{text}"
        );
        assert!(text.contains("IAM_ROLE 'unload-role'"), "{text}");
    }

    #[test]
    fn test_unload_rewrite_is_idempotent() {
        let mut connections =
            workload_with("UNLOAD ('select 1') TO 's3://source/exports/day1' IAM_ROLE '';");
        let rewriter = StatementRewriter::new().unwrap();
        rewriter.apply_unload_rewrites(
            &mut connections,
            "s3://replay-bucket/output",
            "run-2023",
            "unload-role",
        );
        let once = first_text(&connections).to_string();
        rewriter.apply_unload_rewrites(
            &mut connections,
            "s3://replay-bucket/output",
            "run-2023",
            "unload-role",
        );
        assert_eq!(first_text(&connections), once);
    }

    #[test]
    fn test_create_user_passwords_unique_and_complex() {
        let mut connections = workload_with(
            "CREATE USER u1 PASSWORD '***'; CREATE USER u2 PASSWORD '***';",
        );
        let rewriter = StatementRewriter::new().unwrap();
        rewriter.assign_create_user_passwords(&mut connections);
        let text = first_text(&connections);
        assert!(!text.contains("'***'"), "{text}");

        let passwords: Vec<&str> = Regex::new(r"PASSWORD '([^']+)'")
            .unwrap()
            .captures_iter(text)
            .map(|c| c.get(1).unwrap().as_str())
            .collect();
        assert_eq!(passwords.len(), 2);
        assert_ne!(passwords[0], passwords[1]);
        for p in passwords {
            assert_eq!(p.len(), 64);
            assert!(p.chars().any(|c| c.is_ascii_uppercase()));
            assert!(p.chars().any(|c| c.is_ascii_lowercase()));
            assert!(p.chars().any(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_non_copy_statements_untouched() {
        let mut connections = workload_with("SELECT 1;");
        let rewriter = StatementRewriter::new().unwrap();
        rewriter
            .apply_copy_replacements(
                &mut connections,
                &table(&[("s3://old/path", "s3://new/path", "role")]),
            )
            .unwrap();
        assert_eq!(first_text(&connections), "SELECT 1;");
    }
}
