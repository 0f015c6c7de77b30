//! Per-segment outcome accounting
//!
//! Failures are values keyed by dbid, never errors: one segment failing
//! does not stop its siblings, and the caller decides the exit status
//! from the aggregate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Stage a segment failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    Validation,
    Catalog,
    Checkpoint,
    ProcessCheck,
    BaseBackup,
    Rewind,
    Start,
    Stop,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Validation => "validation",
            FailureStage::Catalog => "catalog update",
            FailureStage::Checkpoint => "checkpoint",
            FailureStage::ProcessCheck => "process check",
            FailureStage::BaseBackup => "base backup",
            FailureStage::Rewind => "rewind",
            FailureStage::Start => "start",
            FailureStage::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Why one segment could not be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub dbid: i32,
    pub stage: FailureStage,
    pub message: String,
}

impl SegmentFailure {
    pub fn new(dbid: i32, stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            dbid,
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for SegmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dbid {}: {} failed: {}", self.dbid, self.stage, self.message)
    }
}

/// Outcome of one recovery pass
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Segments recovered and started
    pub succeeded: BTreeSet<i32>,
    /// Segments that failed, first failure wins
    pub failures: BTreeMap<i32, SegmentFailure>,
    pub duration: Duration,
}

impl RecoveryReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record_success(&mut self, dbid: i32) {
        if !self.failures.contains_key(&dbid) {
            self.succeeded.insert(dbid);
        }
    }

    pub fn record_failure(&mut self, failure: SegmentFailure) {
        self.succeeded.remove(&failure.dbid);
        self.failures.entry(failure.dbid).or_insert(failure);
    }

    pub fn is_failed(&self, dbid: i32) -> bool {
        self.failures.contains_key(&dbid)
    }

    /// One line per failed segment, for stderr
    pub fn error_text(&self) -> String {
        self.failures
            .values()
            .map(SegmentFailure::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded.len() + self.failures.len();
        if total == 0 {
            100.0
        } else {
            (self.succeeded.len() as f64 / total as f64) * 100.0
        }
    }

    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} recovered, {} failed in {:?} ({:.1}% success rate)",
            self.succeeded.len(),
            self.failures.len(),
            self.duration,
            self.success_rate()
        )
    }
}
