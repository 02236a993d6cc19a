//! Per-transaction statement file parsing.
//!
//! A statement file carries one transaction: per-line timing directives
//! (`--Record time:`, `--Start time:`, `--End time:`, `--Time interval:`)
//! interleaved with raw SQL. Identity directives (`--Database:` etc.) may be
//! present; older captures encode the identity only in the file name,
//! `<database>-<user>-<pid>-<xid>.sql`.

use chrono::{DateTime, Utc};
use replay_model::{parse_timestamp, Query, Transaction};
use tracing::warn;

/// Why a statement file could not be turned into a replayable transaction.
/// These are capture defects, logged and skipped by the loader.
#[derive(Debug, thiserror::Error)]
pub enum StatementFileError {
    #[error("could not determine database/user/pid/xid from directives or filename {0:?}")]
    UnresolvedIdentity(String),

    #[error("first query has no resolvable start time in {0:?}")]
    MissingStartTime(String),

    #[error("file {0:?} contains no SQL")]
    Empty(String),

    #[error("bad timing directive {directive:?} in {filename:?}: {source}")]
    BadTimestamp {
        filename: String,
        directive: String,
        source: chrono::ParseError,
    },
}

#[derive(Default)]
struct QueryDraft {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    text: String,
}

impl QueryDraft {
    fn finish(self, filename: &str) -> Result<Option<Query>, StatementFileError> {
        let text = normalize_whitespace(&self.text);
        if text.is_empty() {
            return Ok(None);
        }
        let start = self
            .start_time
            .ok_or_else(|| StatementFileError::MissingStartTime(filename.to_string()))?;
        let end = self.end_time.unwrap_or(start);
        Ok(Some(Query::new(start, end, text)))
    }
}

/// Parse one statement file into a [`Transaction`].
///
/// Statement text between two timing directives is concatenated into a single
/// query; `--`-prefixed lines that are not recognized directives are dropped
/// as comments.
pub fn parse_statement_file(
    filename: &str,
    contents: &str,
) -> Result<Transaction, StatementFileError> {
    let mut queries: Vec<Query> = Vec::new();
    let mut draft = QueryDraft::default();
    let mut pacing_flag = true;

    let mut database_name: Option<String> = None;
    let mut username: Option<String> = None;
    let mut pid: Option<u32> = None;
    let mut xid: Option<u64> = None;

    let parse_time = |directive: &str, value: &str| {
        parse_timestamp(value).map_err(|source| StatementFileError::BadTimestamp {
            filename: filename.to_string(),
            directive: directive.to_string(),
            source,
        })
    };

    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("--Time interval:") {
            pacing_flag = value.trim().eq_ignore_ascii_case("true");
        } else if let Some(value) = line.strip_prefix("--Record time:") {
            // a record-time directive closes the previous query
            if let Some(query) = std::mem::take(&mut draft).finish(filename)? {
                queries.push(query);
            }
            let t = parse_time("Record time", value)?;
            draft.start_time = Some(t);
            draft.end_time = Some(t);
        } else if let Some(value) = line.strip_prefix("--Start time:") {
            draft.start_time = Some(parse_time("Start time", value)?);
        } else if let Some(value) = line.strip_prefix("--End time:") {
            draft.end_time = Some(parse_time("End time", value)?);
        } else if let Some(value) = line.strip_prefix("--Database:") {
            database_name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("--Username:") {
            username = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("--Pid:") {
            pid = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("--Xid:") {
            xid = value.trim().parse().ok();
        } else if !line.starts_with("--") {
            draft.text.push(' ');
            draft.text.push_str(line);
        }
    }

    if let Some(query) = draft.finish(filename)? {
        queries.push(query);
    }
    if queries.is_empty() {
        return Err(StatementFileError::Empty(filename.to_string()));
    }

    // fall back to the filename for identity fields the directives didn't cover
    if database_name.is_none() || username.is_none() || pid.is_none() || xid.is_none() {
        let (f_db, f_user, f_pid, f_xid) = parse_filename(filename)
            .ok_or_else(|| StatementFileError::UnresolvedIdentity(filename.to_string()))?;
        database_name.get_or_insert(f_db);
        username.get_or_insert(f_user);
        pid.get_or_insert(f_pid);
        xid.get_or_insert(f_xid);
    }

    queries.sort_by_key(|q| q.start_time);

    let (Some(database_name), Some(username), Some(pid), Some(xid)) =
        (database_name, username, pid, xid)
    else {
        return Err(StatementFileError::UnresolvedIdentity(filename.to_string()));
    };

    Ok(Transaction {
        database_name,
        username,
        pid,
        xid,
        pacing_flag,
        queries,
    })
}

/// Recover `(database, username, pid, xid)` from a statement file name.
///
/// The format is `<database>-<username>-<pid>-<xid>[.sql]`. Both the database
/// and the username may themselves contain `-`; a greedy username match
/// resolves the ambiguity the same way for every file, which is what the
/// extraction side assumes.
pub fn parse_filename(filename: &str) -> Option<(String, String, u32, u64)> {
    let stem = filename.strip_suffix(".sql").unwrap_or(filename);

    let (rest, xid_str) = stem.rsplit_once('-')?;
    let (rest, pid_str) = rest.rsplit_once('-')?;
    let (database, username) = rest.split_once('-')?;

    if database.is_empty() || username.is_empty() {
        warn!("Failed to parse filename {filename}");
        return None;
    }

    let pid = pid_str.parse().ok()?;
    let xid = xid_str.parse().ok()?;
    Some((database.to_string(), username.to_string(), pid, xid))
}

/// Collapse runs of whitespace left by line concatenation.
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Serialize a transaction back to statement-file form.
///
/// Used when re-exporting a filtered or rewritten capture; parsing the result
/// yields the same queries in the same order, with text equal up to whitespace
/// normalization.
pub fn serialize_statement_file(transaction: &Transaction) -> String {
    let mut out = String::new();
    out.push_str(&format!("--Database: {}\n", transaction.database_name));
    out.push_str(&format!("--Username: {}\n", transaction.username));
    out.push_str(&format!("--Pid: {}\n", transaction.pid));
    out.push_str(&format!("--Xid: {}\n", transaction.xid));
    out.push_str(&format!(
        "--Time interval: {}\n",
        if transaction.pacing_flag { "True" } else { "False" }
    ));
    for query in &transaction.queries {
        out.push_str(&format!(
            "--Record time: {}\n",
            query.start_time.to_rfc3339()
        ));
        out.push_str(&format!("--Start time: {}\n", query.start_time.to_rfc3339()));
        out.push_str(&format!("--End time: {}\n", query.end_time.to_rfc3339()));
        out.push_str(&query.text);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
--Time interval: True
--Record time: 2023-05-01T10:00:00+00:00
--Start time: 2023-05-01T10:00:01+00:00
--End time: 2023-05-01T10:00:02+00:00
SELECT * FROM events
WHERE id > 5;
--Record time: 2023-05-01T10:00:10+00:00
--some free-form comment
INSERT INTO audit VALUES (1);
";

    #[test]
    fn test_parse_two_queries() {
        let t = parse_statement_file("dev-alice-1001-42.sql", FILE).unwrap();
        assert_eq!(t.database_name, "dev");
        assert_eq!(t.username, "alice");
        assert_eq!(t.pid, 1001);
        assert_eq!(t.xid, 42);
        assert!(t.pacing_flag);
        assert_eq!(t.queries.len(), 2);
        assert_eq!(t.queries[0].text, "SELECT * FROM events WHERE id > 5;");
        assert_eq!(t.queries[1].text, "INSERT INTO audit VALUES (1);");
        // explicit start/end directives win over record time
        assert_eq!(
            t.queries[0].end_time - t.queries[0].start_time,
            chrono::Duration::seconds(1)
        );
    }

    #[test]
    fn test_identity_directives_win_over_filename() {
        let contents = format!(
            "--Database: prod\n--Username: svc-etl\n--Pid: 7\n--Xid: 9\n{FILE}"
        );
        let t = parse_statement_file("dev-alice-1001-42.sql", &contents).unwrap();
        assert_eq!(t.database_name, "prod");
        assert_eq!(t.username, "svc-etl");
        assert_eq!(t.pid, 7);
        assert_eq!(t.xid, 9);
    }

    #[test]
    fn test_queries_sorted_by_start_time() {
        let contents = "\
--Record time: 2023-05-01T10:00:10+00:00
SELECT 2;
--Record time: 2023-05-01T10:00:00+00:00
SELECT 1;
";
        let t = parse_statement_file("dev-alice-1-2.sql", contents).unwrap();
        assert_eq!(t.queries[0].text, "SELECT 1;");
        assert_eq!(t.queries[1].text, "SELECT 2;");
    }

    #[test]
    fn test_missing_start_time_rejected() {
        let contents = "SELECT 1;\n";
        let err = parse_statement_file("dev-alice-1-2.sql", contents).unwrap_err();
        assert!(matches!(err, StatementFileError::MissingStartTime(_)));
    }

    #[test]
    fn test_pacing_flag_off() {
        let contents = "\
--Time interval: False
--Record time: 2023-05-01T10:00:00+00:00
SELECT 1;
";
        let t = parse_statement_file("dev-alice-1-2.sql", contents).unwrap();
        assert!(!t.pacing_flag);
    }

    #[test]
    fn test_parse_filename_with_dashes_in_username() {
        let (db, user, pid, xid) = parse_filename("dev-svc-etl-loader-1001-42.sql").unwrap();
        assert_eq!(db, "dev");
        assert_eq!(user, "svc-etl-loader");
        assert_eq!(pid, 1001);
        assert_eq!(xid, 42);
    }

    #[test]
    fn test_parse_filename_rejects_garbage() {
        assert!(parse_filename("nodashes.sql").is_none());
        assert!(parse_filename("a-b-notnum-42.sql").is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = parse_statement_file("dev-alice-1001-42.sql", FILE).unwrap();
        let serialized = serialize_statement_file(&original);
        let reparsed = parse_statement_file("dev-alice-1001-42.sql", &serialized).unwrap();

        assert_eq!(reparsed.queries.len(), original.queries.len());
        for (a, b) in original.queries.iter().zip(&reparsed.queries) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.start_time, b.start_time);
            assert_eq!(a.end_time, b.end_time);
        }
        assert_eq!(reparsed.pacing_flag, original.pacing_flag);
        assert_eq!(reparsed.base_filename(), original.base_filename());
    }
}
