//! Replays a captured multi-session database workload against a target
//! cluster, preserving the relative timing between sessions, transactions
//! and queries.

pub mod config;
pub mod export;
pub mod replay;
pub mod system_tables;
