//! Concurrent message processing on top of the priority queue.

pub mod classify;
pub mod pool;

pub use classify::{Disposition, FailureClassifier, KeywordClassifier};
pub use pool::{assign_priority, PoolOptions, PoolPhase, PoolStats, WorkerPool};
