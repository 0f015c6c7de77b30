//! Heap checksum consistency
//!
//! Every instance must agree with the coordinator on whether data pages
//! carry checksums. A recovered segment copied from a donor with a
//! different setting would silently diverge, so donors are checked before
//! any recovery runs.

use segrecover_core::{shell_quote, CommandRunner, PoolError, RemoteCommand, Segment, WorkerPool};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::assess::controldata_value;

/// `pg_controldata` field holding the checksum version
pub const CHECKSUM_FIELD: &str = "Data page checksum version";

const READ_CHECKSUM: &str = "read heap checksum setting";

/// Checksum verification errors
#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("Failed to read the heap checksum setting on the coordinator: {0}")]
    Coordinator(String),

    #[error("No segments responded to ssh query for heap checksum validation.")]
    NoResponses,

    #[error("Heap checksum setting differences reported on segments: {0:?}")]
    Inconsistent(Vec<i32>),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub type Result<T> = std::result::Result<T, ChecksumError>;

/// Per-segment comparison against the coordinator
#[derive(Debug, Clone, Default)]
pub struct ChecksumReport {
    pub coordinator_value: String,
    /// Segments matching the coordinator
    pub consistent: Vec<i32>,
    /// Segments reporting a different value, with that value
    pub inconsistent: BTreeMap<i32, String>,
    /// Segments that could not be read
    pub failures: BTreeMap<i32, String>,
}

impl ChecksumReport {
    /// At least one segment answered and none disagreed
    pub fn are_segments_consistent(&self) -> bool {
        !self.consistent.is_empty() && self.inconsistent.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "checksum version {}: {} consistent, {} inconsistent, {} unreadable",
            self.coordinator_value,
            self.consistent.len(),
            self.inconsistent.len(),
            self.failures.len()
        )
    }
}

/// Compares `pg_controldata` checksum versions across the cluster
pub struct HeapChecksumVerifier {
    runner: Arc<dyn CommandRunner>,
    workers: usize,
    gphome: String,
}

impl HeapChecksumVerifier {
    pub fn new(runner: Arc<dyn CommandRunner>, workers: usize, gphome: impl Into<String>) -> Self {
        Self {
            runner,
            workers,
            gphome: gphome.into(),
        }
    }

    fn read_command(&self, segment: &Segment, host: Option<&str>) -> RemoteCommand {
        RemoteCommand::on(
            READ_CHECKSUM,
            format!("$GPHOME/bin/pg_controldata {}", shell_quote(&segment.datadir)),
            host,
        )
        .with_gphome(&self.gphome)
        .for_dbid(segment.dbid)
    }

    /// Read the coordinator locally and every segment remotely
    #[instrument(skip(self, coordinator, segments), fields(segments = segments.len()))]
    pub async fn verify(&self, coordinator: &Segment, segments: &[&Segment]) -> Result<ChecksumReport> {
        let mut coordinator_cmd = self.read_command(coordinator, None);
        let result = self.runner.run(&coordinator_cmd).await;
        coordinator_cmd.set_result(result);
        let coordinator_value = checksum_value(&coordinator_cmd)
            .map_err(ChecksumError::Coordinator)?;

        let mut report = ChecksumReport {
            coordinator_value,
            ..Default::default()
        };
        if segments.is_empty() {
            return Ok(report);
        }

        let pool = WorkerPool::new(self.workers.min(segments.len()).max(1), self.runner.clone())?;
        let mut submitted = Ok(());
        for segment in segments {
            submitted = pool
                .submit(self.read_command(segment, Some(segment.hostname.as_str())))
                .await;
            if submitted.is_err() {
                break;
            }
        }
        pool.join().await;
        let completed = pool.take_completed_items();
        pool.shutdown().await;
        submitted?;

        for cmd in completed {
            let Some(dbid) = cmd.dbid else { continue };
            match checksum_value(&cmd) {
                Ok(value) if value == report.coordinator_value => report.consistent.push(dbid),
                Ok(value) => {
                    warn!(dbid, value = %value, coordinator = %report.coordinator_value, "Heap checksum setting differs");
                    report.inconsistent.insert(dbid, value);
                }
                Err(e) => {
                    warn!(dbid, error = %e, "Could not read heap checksum setting");
                    report.failures.insert(dbid, e);
                }
            }
        }
        report.consistent.sort_unstable();
        info!(summary = %report.summary(), "Heap checksum verification complete");
        Ok(report)
    }

    /// Turn a report into a verdict
    pub fn validate(report: &ChecksumReport) -> Result<()> {
        if !report.inconsistent.is_empty() {
            return Err(ChecksumError::Inconsistent(report.inconsistent.keys().copied().collect()));
        }
        if report.consistent.is_empty() {
            return Err(ChecksumError::NoResponses);
        }
        Ok(())
    }
}

fn checksum_value(cmd: &RemoteCommand) -> std::result::Result<String, String> {
    let result = cmd.result().ok_or_else(|| "no result".to_string())?;
    if !result.was_successful() {
        return Err(result.error_message());
    }
    controldata_value(&result.stdout, CHECKSUM_FIELD)
        .map(str::to_string)
        .ok_or_else(|| format!("'{}' not found in pg_controldata output", CHECKSUM_FIELD))
}
