//! Workload loader for workload-replay.
//!
//! Reads a persisted capture (local directory or S3 prefix) into the in-memory
//! model:
//!
//! 1. `connections.json`: one record per captured session ([`manifest`])
//! 2. `SQLs/<db>-<user>-<pid>-<xid>.sql`: one statement file per transaction,
//!    timing directives interleaved with raw SQL ([`statements`])
//!
//! Transactions are then associated with the connection that was active at
//! their start time, connections left without transactions are pruned, and
//! inter-query pacing intervals are derived ([`loader`]).
//!
//! Malformed records and statement files are logged and skipped; only an
//! unreadable workload location is an error.

mod loader;
mod manifest;
mod statements;

pub use loader::{load_workload, LoaderOptions, Workload};
pub use manifest::parse_connections;
pub use statements::{
    parse_filename, parse_statement_file, serialize_statement_file, StatementFileError,
};
