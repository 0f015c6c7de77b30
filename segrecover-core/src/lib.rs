//! Segrecover Core Library
//!
//! Core abstractions shared by the recovery tooling.
//! This crate provides:
//! - Cluster topology model (segments, primary/mirror pairs, host groupings)
//! - Remote command execution over ssh with a pluggable runner
//! - Bounded worker pool for running commands across many hosts
//! - Scoped interrupt masking for destructive phases
//! - Common error handling

pub mod command;
pub mod error;
pub mod pool;
pub mod signal;
pub mod topology;

pub use command::{shell_quote, CommandResult, CommandRunner, ExecutionContext, RemoteCommand, ShellRunner};
pub use error::{Result, SegrecoverError};
pub use pool::{PoolError, WorkerPool};
pub use signal::SignalMask;
pub use topology::{ClusterTopology, Mode, Role, Segment, SegmentPair, Status};

/// Content id carried by the coordinator and its standby
pub const COORDINATOR_CONTENT_ID: i32 = -1;

/// Default number of parallel workers for recovery batches
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Upper bound accepted for `--batch-size`
pub const MAX_BATCH_SIZE: usize = 64;

/// Read the batch size from environment, falling back to the compile-time default.
pub fn batch_size_from_env() -> usize {
    std::env::var("SEGRECOVER_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| (1..=MAX_BATCH_SIZE).contains(n))
        .unwrap_or(DEFAULT_BATCH_SIZE)
}
