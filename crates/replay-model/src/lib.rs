//! Capture data model for workload-replay.
//!
//! A captured workload is a set of [`ConnectionLog`]s, each owning the
//! [`Transaction`]s (and their [`Query`]s) that ran on that session. The types
//! here are pure data plus derived timing helpers; all mutation after load time
//! happens in the statement rewriter, which only touches query text.
//!
//! Timestamps are capture-side wall clock times in UTC. Replay timing is always
//! expressed as an offset in milliseconds from the workload's first event, so
//! the model never needs to know when the replay itself started.

mod capture;
mod filters;
mod time;

pub use capture::{ConnectionLog, PacingMode, Protocol, Query, QueryPacing, Transaction};
pub use filters::{FilterError, FilterSpec, Filters};
pub use time::parse_timestamp;
