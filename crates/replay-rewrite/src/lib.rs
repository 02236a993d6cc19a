//! Statement rewriting for workload-replay.
//!
//! Captured SQL refers to the source environment: COPY statements read from
//! the original object-storage paths with credentials the extraction blanked
//! out, UNLOAD statements write to the original destinations, and CREATE USER
//! statements carry `'***'` password placeholders. Before replay the whole
//! in-memory workload is rewritten in place:
//!
//! - COPY source paths are swapped via the replacement table and the blanked
//!   credential clause becomes the configured authorization role
//! - UNLOAD destinations are retargeted under the run-scoped output prefix
//! - password placeholders become fresh random passwords
//!
//! A COPY whose source path matches the replacement table but has no role to
//! authorize it is a configuration error and fails the run before any
//! connection is attempted.

mod rewriter;
mod table;

pub use rewriter::{RewriteError, StatementRewriter};
pub use table::{Replacement, ReplacementTable, ReplacementTableError};
