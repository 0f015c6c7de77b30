//! Target assessment
//!
//! Before planning, each recovery target is probed on its host:
//! - whether its data directory is missing, empty or populated
//! - whether its control-file timeline is an ancestor of the donor's,
//!   which decides if rewind can work or a full copy is needed

use segrecover_core::{shell_quote, CommandRunner, PoolError, RemoteCommand, WorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::planner::RecoveryCandidate;

const PROBE_DIRECTORY: &str = "probe target directory";
const READ_TARGET_CONTROL: &str = "read target control data";
const READ_DONOR_CONTROL: &str = "read donor control data";

pub const TIMELINE_FIELD: &str = "Latest checkpoint's TimeLineID";
pub const PREV_TIMELINE_FIELD: &str = "Latest checkpoint's PrevTimeLineID";

/// State of a target data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryState {
    Missing,
    Empty,
    NonEmpty,
    #[default]
    Unknown,
}

impl DirectoryState {
    fn from_probe(output: &str) -> Self {
        match output.trim() {
            "missing" => DirectoryState::Missing,
            "empty" => DirectoryState::Empty,
            "nonempty" => DirectoryState::NonEmpty,
            _ => DirectoryState::Unknown,
        }
    }
}

/// How the target's history relates to the donor's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimelineRelation {
    /// Target timeline is the donor's or its direct parent: rewind can work
    Ancestor,
    Diverged,
    #[default]
    Unknown,
}

/// Everything the planner needs to know about one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetAssessment {
    pub directory: DirectoryState,
    pub timeline: TimelineRelation,
}

/// Timeline fields from `pg_controldata`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlData {
    pub timeline: Option<u32>,
    pub prev_timeline: Option<u32>,
}

impl ControlData {
    pub fn parse(output: &str) -> Self {
        Self {
            timeline: controldata_value(output, TIMELINE_FIELD).and_then(|v| v.parse().ok()),
            prev_timeline: controldata_value(output, PREV_TIMELINE_FIELD)
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Value of `field` in `pg_controldata` output (`Field name:   value`)
pub fn controldata_value<'a>(output: &'a str, field: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim() == field {
            Some(value.trim())
        } else {
            None
        }
    })
}

pub fn timeline_relation(target: &ControlData, donor: &ControlData) -> TimelineRelation {
    match (target.timeline, donor.timeline) {
        (Some(t), Some(d)) if t == d => TimelineRelation::Ancestor,
        (Some(t), Some(_)) if donor.prev_timeline == Some(t) => TimelineRelation::Ancestor,
        (Some(_), Some(_)) => TimelineRelation::Diverged,
        _ => TimelineRelation::Unknown,
    }
}

fn directory_probe(datadir: &str) -> String {
    let dir = shell_quote(datadir);
    format!(
        "if [ ! -e {dir} ]; then echo missing; elif [ -z \"$(ls -A {dir})\" ]; then echo empty; else echo nonempty; fi"
    )
}

fn controldata_command(datadir: &str) -> String {
    format!("$GPHOME/bin/pg_controldata {}", shell_quote(datadir))
}

/// Probes recovery targets through a worker pool
pub struct TargetAssessor {
    runner: Arc<dyn CommandRunner>,
    batch_size: usize,
    gphome: String,
}

impl TargetAssessor {
    pub fn new(runner: Arc<dyn CommandRunner>, batch_size: usize, gphome: impl Into<String>) -> Self {
        Self {
            runner,
            batch_size,
            gphome: gphome.into(),
        }
    }

    /// Assess every candidate. Timelines are read only when `with_timeline`
    /// is set and the target is rebuilt in place.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn assess(
        &self,
        candidates: &[RecoveryCandidate],
        with_timeline: bool,
    ) -> Result<HashMap<i32, TargetAssessment>, PoolError> {
        let mut assessments: HashMap<i32, TargetAssessment> = HashMap::new();
        if candidates.is_empty() {
            return Ok(assessments);
        }

        let workers = self.batch_size.min(candidates.len() * 3).max(1);
        let pool = WorkerPool::new(workers, self.runner.clone())?;
        let outcome = self.probe_all(&pool, candidates, with_timeline).await;
        let completed = pool.take_completed_items();
        pool.shutdown().await;
        outcome?;

        let mut target_control: HashMap<i32, ControlData> = HashMap::new();
        let mut donor_control: HashMap<i32, ControlData> = HashMap::new();
        for cmd in completed {
            let Some(dbid) = cmd.dbid else { continue };
            let entry = assessments.entry(dbid).or_default();
            let Some(result) = cmd.result().filter(|r| r.was_successful()) else {
                warn!(dbid, name = %cmd.name, host = ?cmd.host(), "Target probe failed");
                continue;
            };
            match cmd.name.as_str() {
                PROBE_DIRECTORY => entry.directory = DirectoryState::from_probe(&result.stdout),
                READ_TARGET_CONTROL => {
                    target_control.insert(dbid, ControlData::parse(&result.stdout));
                }
                READ_DONOR_CONTROL => {
                    donor_control.insert(dbid, ControlData::parse(&result.stdout));
                }
                _ => {}
            }
        }

        for (dbid, assessment) in assessments.iter_mut() {
            if let (Some(target), Some(donor)) = (target_control.get(dbid), donor_control.get(dbid)) {
                assessment.timeline = timeline_relation(target, donor);
            }
            debug!(dbid, directory = ?assessment.directory, timeline = ?assessment.timeline, "Target assessed");
        }
        Ok(assessments)
    }

    async fn probe_all(
        &self,
        pool: &WorkerPool,
        candidates: &[RecoveryCandidate],
        with_timeline: bool,
    ) -> Result<(), PoolError> {
        for candidate in candidates {
            let target = &candidate.target;
            let dbid = target.dbid;
            pool.submit(
                RemoteCommand::remote(PROBE_DIRECTORY, directory_probe(&target.datadir), &target.hostname)
                    .for_dbid(dbid),
            )
            .await?;

            if with_timeline && !candidate.failover {
                pool.submit(
                    RemoteCommand::remote(READ_TARGET_CONTROL, controldata_command(&target.datadir), &target.hostname)
                        .with_gphome(&self.gphome)
                        .for_dbid(dbid),
                )
                .await?;
                let donor = &candidate.donor;
                pool.submit(
                    RemoteCommand::remote(READ_DONOR_CONTROL, controldata_command(&donor.datadir), &donor.hostname)
                        .with_gphome(&self.gphome)
                        .for_dbid(dbid),
                )
                .await?;
            }
        }
        pool.join().await;
        Ok(())
    }
}
