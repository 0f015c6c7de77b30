//! Rebalancing segments back to their preferred roles
//!
//! A pair is unbalanced when its mirror took over as primary. Rebalancing
//! stops the acting primary so the preferred primary gets promoted back,
//! then recovers the stopped segment as a mirror:
//!
//! `Unbalanced -> Stopping -> Reconfiguring -> Resynchronizing -> Done`
//!
//! Stopping and reconfiguring run with interrupts masked. A cluster left
//! half-stopped is worse than one never touched.

use segrecover_core::{
    shell_quote, ClusterTopology, CommandRunner, PoolError, RemoteCommand, Segment, SignalMask,
    WorkerPool,
};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::report::{FailureStage, SegmentFailure};

const STOP_PRIMARIES: &str = "stop unbalanced primaries";
const CHECK_REACHABLE: &str = "check host reachability";

/// Rebalance progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    Unbalanced,
    Stopping,
    Reconfiguring,
    Resynchronizing,
    Done,
}

/// How a rebalance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceOutcome {
    NothingToDo,
    Full,
    /// Some pairs were skipped or failed; the cluster is still usable
    Partial,
}

impl RebalanceOutcome {
    pub fn is_full(self) -> bool {
        matches!(self, RebalanceOutcome::NothingToDo | RebalanceOutcome::Full)
    }
}

impl fmt::Display for RebalanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceOutcome::NothingToDo => f.write_str("nothing to do"),
            RebalanceOutcome::Full => f.write_str("full"),
            RebalanceOutcome::Partial => f.write_str("partial"),
        }
    }
}

/// A pair left alone, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPair {
    pub content: i32,
    pub reason: String,
}

/// Pairs chosen for rebalancing
#[derive(Debug, Clone, Default)]
pub struct RebalanceSelection {
    /// Acting primaries out of their preferred role
    pub to_stop: Vec<Segment>,
    pub skipped: Vec<SkippedPair>,
}

impl RebalanceSelection {
    pub fn is_empty(&self) -> bool {
        self.to_stop.is_empty()
    }
}

/// Choose the pairs that can be rebalanced safely.
///
/// Balanced pairs are ignored. An unbalanced pair qualifies only when both
/// members are up, reachable and synchronized.
pub fn determine_unbalanced(topology: &ClusterTopology) -> RebalanceSelection {
    let mut selection = RebalanceSelection::default();
    for pair in topology.segment_pairs() {
        if pair.balanced() {
            continue;
        }
        let reason = if !pair.up() {
            Some("a segment in the pair is down")
        } else if !pair.reachable() {
            Some("a segment host in the pair is unreachable")
        } else if !pair.synchronized() {
            Some("the pair is not synchronized")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                warn!(content = pair.content(), reason, "Skipping unbalanced pair");
                selection.skipped.push(SkippedPair {
                    content: pair.content(),
                    reason: reason.to_string(),
                });
            }
            None => selection.to_stop.push(pair.primary.clone()),
        }
    }
    selection
}

/// Outcome of the stop stage
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub stopped: Vec<i32>,
    pub failures: Vec<SegmentFailure>,
}

impl StopReport {
    pub fn all_stopped(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Hosts that do not answer a trivial ssh command
#[instrument(skip(runner, hosts))]
pub async fn unreachable_hosts(
    runner: Arc<dyn CommandRunner>,
    hosts: &[String],
    batch_size: usize,
) -> Result<HashSet<String>, PoolError> {
    if hosts.is_empty() {
        return Ok(HashSet::new());
    }
    let pool = WorkerPool::new(batch_size.min(hosts.len()).max(1), runner)?;
    let mut submitted = Ok(());
    for host in hosts {
        submitted = pool
            .submit(RemoteCommand::remote(CHECK_REACHABLE, "true", host))
            .await;
        if submitted.is_err() {
            break;
        }
    }
    pool.join().await;
    let completed = pool.take_completed_items();
    pool.shutdown().await;
    submitted?;

    let unreachable: HashSet<String> = completed
        .iter()
        .filter(|cmd| !cmd.was_successful())
        .filter_map(|cmd| cmd.host().map(str::to_string))
        .collect();
    for host in &unreachable {
        warn!(host = %host, "Host is unreachable");
    }
    Ok(unreachable)
}

/// Drives one rebalance through its states
pub struct RebalanceOperation {
    runner: Arc<dyn CommandRunner>,
    batch_size: usize,
    gphome: String,
    stop_timeout_secs: u64,
    state: RebalanceState,
    partial: bool,
}

impl RebalanceOperation {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        batch_size: usize,
        gphome: impl Into<String>,
        stop_timeout_secs: u64,
    ) -> Self {
        Self {
            runner,
            batch_size,
            gphome: gphome.into(),
            stop_timeout_secs,
            state: RebalanceState::Unbalanced,
            partial: false,
        }
    }

    pub fn state(&self) -> RebalanceState {
        self.state
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Record that part of the work was skipped or failed
    pub fn mark_partial(&mut self) {
        self.partial = true;
    }

    fn transition(&mut self, next: RebalanceState) {
        debug!(from = ?self.state, to = ?next, "Rebalance state change");
        self.state = next;
    }

    /// Stop every selected primary, one command per host
    #[instrument(skip(self, to_stop), fields(segments = to_stop.len()))]
    pub async fn stop_primaries(&mut self, to_stop: &[Segment]) -> Result<StopReport, PoolError> {
        self.transition(RebalanceState::Stopping);
        let _mask = SignalMask::acquire();

        let by_host = ClusterTopology::segments_by_host(to_stop);
        if by_host.is_empty() {
            return Ok(StopReport::default());
        }
        info!(hosts = by_host.len(), segments = to_stop.len(), "Stopping unbalanced primary segments");

        let pool = WorkerPool::new(self.batch_size.min(by_host.len()).max(1), self.runner.clone())?;
        let mut submitted = Ok(());
        for (host, segments) in &by_host {
            submitted = pool.submit(self.stop_command(host, segments)).await;
            if submitted.is_err() {
                break;
            }
        }
        pool.join().await;
        let completed = pool.take_completed_items();
        pool.shutdown().await;
        submitted?;

        let report = collect_stops(&by_host, &completed);
        if !report.all_stopped() {
            self.partial = true;
            for failure in &report.failures {
                warn!(dbid = failure.dbid, error = %failure.message, "Failed to stop segment");
            }
        }
        Ok(report)
    }

    pub fn begin_reconfigure(&mut self) {
        self.transition(RebalanceState::Reconfiguring);
    }

    pub fn begin_resynchronize(&mut self) {
        self.transition(RebalanceState::Resynchronizing);
    }

    /// Close out the operation
    pub fn finish(&mut self, did_work: bool) -> RebalanceOutcome {
        self.transition(RebalanceState::Done);
        if self.partial {
            RebalanceOutcome::Partial
        } else if did_work {
            RebalanceOutcome::Full
        } else {
            RebalanceOutcome::NothingToDo
        }
    }

    fn stop_command(&self, host: &str, segments: &[Segment]) -> RemoteCommand {
        let cmd = segments
            .iter()
            .map(|seg| {
                format!(
                    "if $GPHOME/bin/pg_ctl -D {} -m fast -w -t {} stop >/dev/null 2>&1; then echo stopped:{}; else echo failed:{}; fi",
                    shell_quote(&seg.datadir),
                    self.stop_timeout_secs,
                    seg.dbid,
                    seg.dbid
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        RemoteCommand::remote(STOP_PRIMARIES, cmd, host).with_gphome(&self.gphome)
    }
}

/// Match per-segment markers in each host's output back to segments
fn collect_stops(by_host: &BTreeMap<String, Vec<Segment>>, completed: &[RemoteCommand]) -> StopReport {
    let mut report = StopReport::default();
    for (host, segments) in by_host {
        let result = completed
            .iter()
            .find(|cmd| cmd.host() == Some(host.as_str()))
            .and_then(RemoteCommand::result);

        for seg in segments {
            let Some(result) = result else {
                report.failures.push(SegmentFailure::new(seg.dbid, FailureStage::Stop, "stop command did not run"));
                continue;
            };
            let stopped = format!("stopped:{}", seg.dbid);
            let failed = format!("failed:{}", seg.dbid);
            let mut lines = result.stdout.lines().map(str::trim);
            if lines.clone().any(|l| l == stopped) {
                report.stopped.push(seg.dbid);
            } else if lines.any(|l| l == failed) {
                report.failures.push(SegmentFailure::new(
                    seg.dbid,
                    FailureStage::Stop,
                    format!("pg_ctl stop failed for {} on {}", seg.datadir, host),
                ));
            } else {
                report.failures.push(SegmentFailure::new(seg.dbid, FailureStage::Stop, result.error_message()));
            }
        }
    }
    report
}
