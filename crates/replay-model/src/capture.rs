//! Connection, transaction and query records of a captured workload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One SQL statement (or statement batch) recorded during capture.
///
/// `text` may contain several `;`-separated statements when the capture
/// concatenated lines between two timing directives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// When the query started on the source cluster
    pub start_time: DateTime<Utc>,
    /// When the query finished on the source cluster
    pub end_time: DateTime<Utc>,
    /// The SQL text, possibly rewritten before replay
    pub text: String,
    /// Seconds to wait after this query before issuing the next one.
    /// Assigned by the loader when inter-query pacing is in effect, 0 otherwise.
    pub time_interval: f64,
}

impl Query {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>, text: String) -> Self {
        Self {
            start_time,
            end_time,
            text,
            time_interval: 0.0,
        }
    }

    /// Elapsed milliseconds from `ref_time` to this query's captured start.
    pub fn offset_ms(&self, ref_time: DateTime<Utc>) -> f64 {
        (self.start_time - ref_time).num_milliseconds() as f64
    }
}

/// One unit of work, committed or rolled back as a whole on the source cluster.
///
/// Identified by `(database_name, username, pid, xid)`; belongs to exactly one
/// [`ConnectionLog`] once the loader has associated it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub database_name: String,
    pub username: String,
    pub pid: u32,
    pub xid: u64,
    /// Captured per-transaction pacing flag (`--Time interval:` directive),
    /// honored when the connection's query pacing is [`QueryPacing::AsCaptured`].
    pub pacing_flag: bool,
    /// Queries sorted by `start_time`
    pub queries: Vec<Query>,
}

impl Transaction {
    /// Start of the first query. The loader drops transactions with no
    /// resolvable start time, so retained transactions always have one.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.queries[0].start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.queries[self.queries.len() - 1].end_time
    }

    pub fn offset_ms(&self, ref_time: DateTime<Utc>) -> f64 {
        self.queries[0].offset_ms(ref_time)
    }

    /// Key used for the connection association and error logs:
    /// `<database>-<user>-<pid>`.
    pub fn connection_key(&self) -> String {
        format!("{}-{}-{}", self.database_name, self.username, self.pid)
    }

    /// The statement file stem, `<database>-<user>-<pid>-<xid>`, also the
    /// transaction error log key.
    pub fn base_filename(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.database_name, self.username, self.pid, self.xid
        )
    }
}

/// Config-level pacing override: honor the captured pacing flags, or force
/// pacing on/off for the whole replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum PacingMode {
    /// `""` in the config: use each connection's captured value
    #[default]
    AsCaptured,
    /// `"all on"`
    AllOn,
    /// `"all off"`
    AllOff,
}

impl PacingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacingMode::AsCaptured => "",
            PacingMode::AllOn => "all on",
            PacingMode::AllOff => "all off",
        }
    }

    /// Apply this override to a captured boolean flag.
    pub fn apply(&self, captured: bool) -> bool {
        match self {
            PacingMode::AsCaptured => captured,
            PacingMode::AllOn => true,
            PacingMode::AllOff => false,
        }
    }
}

impl std::str::FromStr for PacingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(PacingMode::AsCaptured),
            "all on" => Ok(PacingMode::AllOn),
            "all off" => Ok(PacingMode::AllOff),
            other => Err(format!(
                "invalid pacing mode {other:?}, expected \"\", \"all on\" or \"all off\""
            )),
        }
    }
}

impl TryFrom<String> for PacingMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PacingMode> for &'static str {
    fn from(mode: PacingMode) -> Self {
        mode.as_str()
    }
}

/// Effective inter-query pacing for one connection, after the config override
/// has been applied to the connection's captured setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPacing {
    /// Pace every transaction's queries
    On,
    /// Never pace queries
    Off,
    /// Defer to each transaction's captured [`Transaction::pacing_flag`]
    AsCaptured,
}

impl QueryPacing {
    /// Whether a given transaction's queries should be paced.
    pub fn paces(&self, transaction: &Transaction) -> bool {
        match self {
            QueryPacing::On => true,
            QueryPacing::Off => false,
            QueryPacing::AsCaptured => transaction.pacing_flag,
        }
    }
}

/// Wire protocol the captured session used, resolved once at load time from
/// `application_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Psql,
    Odbc,
}

impl Protocol {
    /// Resolve the protocol for a session.
    ///
    /// `application_name` substrings win; otherwise the run's configured
    /// default applies. `Odbc` is only selected when an ODBC driver name was
    /// configured, mirroring the capture driver's psql fallback.
    pub fn resolve(application_name: &str, default: Protocol, odbc_configured: bool) -> Protocol {
        let app = application_name.to_lowercase();
        if app.contains("psql") {
            Protocol::Psql
        } else if app.contains("odbc") && odbc_configured {
            Protocol::Odbc
        } else if default == Protocol::Odbc && odbc_configured {
            Protocol::Odbc
        } else {
            Protocol::Psql
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Psql => write!(f, "psql"),
            Protocol::Odbc => write!(f, "odbc"),
        }
    }
}

/// One simulated client session from the capture.
///
/// Constructed by the loader, consumed by exactly one worker task during
/// replay. Read-only during replay except for query text rewriting, which
/// happens before scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLog {
    pub session_initiation_time: Option<DateTime<Utc>>,
    /// Absent when the capture window closed before the session disconnected;
    /// the loader substitutes the workload's last observed event time.
    pub disconnection_time: Option<DateTime<Utc>>,
    pub application_name: String,
    pub database_name: String,
    pub username: String,
    pub pid: u32,
    /// Whether inter-transaction (and disconnect) pacing applies, after the
    /// config override.
    pub pace_transactions: bool,
    /// Inter-query pacing, after the config override.
    pub query_pacing: QueryPacing,
    /// Protocol resolved from `application_name` at load time.
    pub protocol: Protocol,
    /// Owned transactions, sorted by `(start_time, xid)`. Populated once by
    /// the loader, append-only after that.
    pub transactions: Vec<Transaction>,
}

impl ConnectionLog {
    /// Elapsed milliseconds from `ref_time` to the captured session start.
    pub fn offset_ms(&self, ref_time: DateTime<Utc>) -> f64 {
        match self.session_initiation_time {
            Some(start) => (start - ref_time).num_milliseconds() as f64,
            None => 0.0,
        }
    }

    /// Key used to group connections and keyed into the connection error log:
    /// `<database>-<user>-<pid>`.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.database_name, self.username, self.pid)
    }

    /// Fields that include/exclude filters may reference.
    pub fn supported_filters() -> [&'static str; 3] {
        ["database_name", "username", "pid"]
    }
}

impl std::fmt::Display for ConnectionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session initiation time: {:?}, Disconnection time: {:?}, Application name: {}, \
             Database name: {}, Username: {}, PID: {}, Transactions: {}",
            self.session_initiation_time,
            self.disconnection_time,
            self.application_name,
            self.database_name,
            self.username,
            self.pid,
            self.transactions.len(),
        )
    }
}
