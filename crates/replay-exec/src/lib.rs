//! Replay execution: per-connection session drivers and the worker pool that
//! schedules them.
//!
//! Execution is split along two seams. [`SessionConnector`]/[`SqlSession`]
//! abstract the database wire so the state machine in [`session`] can be
//! exercised against mocks; [`scheduler::run_replay`] owns the bounded job
//! queue, the worker tasks, and stats aggregation.

mod postgres;
mod scheduler;
mod session;
mod stats;
mod timing;

pub use postgres::PostgresConnector;
pub use scheduler::{run_replay, default_worker_count, Job, SchedulerOptions};
pub use session::{
    ConnectionExecutor, ProgressCounters, SessionConnector, SessionOptions, SessionState,
    SqlSession, Timeline,
};
pub use stats::{QueryError, ReplayStats};
pub use timing::TimingLog;
