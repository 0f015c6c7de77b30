//! Error types for segrecover
//!
//! Provides a unified error type for topology and command handling.

use thiserror::Error;

/// Result type alias for segrecover operations
pub type Result<T> = std::result::Result<T, SegrecoverError>;

/// Unified error type for segrecover
#[derive(Error, Debug)]
pub enum SegrecoverError {
    // ===== Parse Errors =====
    #[error("Invalid segment row: {0}")]
    InvalidSegment(String),

    #[error("Invalid {field} value: {value:?}")]
    InvalidField { field: &'static str, value: String },

    // ===== Topology Errors =====
    #[error("Duplicate dbid {0} in segment configuration")]
    DuplicateDbid(i32),

    #[error("Content {content} has {primaries} primaries, expected exactly one")]
    PrimaryCount { content: i32, primaries: usize },

    #[error("Content {content} has {count} segments, at most two are allowed")]
    TooManySegments { content: i32, count: usize },

    #[error("No coordinator segment found in configuration")]
    MissingCoordinator,

    #[error("Port {port} is used by more than one segment on host {host}")]
    PortConflict { host: String, port: u16 },

    #[error("Data directory {datadir} is used by more than one segment on host {host}")]
    DirectoryConflict { host: String, datadir: String },

    #[error("Topology error: {0}")]
    Topology(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}
