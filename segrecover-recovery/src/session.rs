//! Recovery session
//!
//! One object owning everything a run needs (configuration, the command
//! transport, the SQL connector and a tracing span carrying the run's
//! context) with an entry point per operation:
//! - `recover`: assess, plan, verify donors, relocate, execute
//! - `rebalance`: stop acting primaries, reconfigure, recover them as mirrors
//! - `verify_checksums`: compare heap checksum settings cluster-wide

use segrecover_catalog::{relocate_mirror, run_statement, CatalogReader, DbConnector, DbError};
use segrecover_core::{
    ClusterTopology, CommandRunner, PoolError, Segment, SegmentPair, SegrecoverError, SignalMask,
};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument, Span};

use crate::assess::TargetAssessor;
use crate::checksum::{ChecksumError, ChecksumReport, HeapChecksumVerifier};
use crate::config::RecoveryConfig;
use crate::confinfo::{self, render_directives, DirectiveError, RecoveryDirective, ResolvedDirective};
use crate::executor::{ExecutorConfig, RecoveryExecutor};
use crate::planner::{find_candidates, Planner, PlannerConfig, RecoveryPlan};
use crate::rebalance::{
    determine_unbalanced, unreachable_hosts, RebalanceOperation, RebalanceOutcome, SkippedPair,
    StopReport,
};
use crate::reconfigure::{ReconfigureError, SegmentReconfigurer, FTS_PROBE_SCAN};
use crate::report::{FailureStage, RecoveryReport, SegmentFailure};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Directive(#[from] DirectiveError),

    #[error(transparent)]
    Reconfigure(#[from] ReconfigureError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Topology(#[from] SegrecoverError),

    #[error("Recovery validation failed:\n{}", failure_lines(.0))]
    Validation(Vec<SegmentFailure>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

fn failure_lines(failures: &[SegmentFailure]) -> String {
    failures
        .iter()
        .map(SegmentFailure::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Everything a rebalance did
#[derive(Debug, Clone)]
pub struct RebalanceReport {
    pub outcome: RebalanceOutcome,
    pub skipped: Vec<SkippedPair>,
    pub stop: StopReport,
    /// Recovery of the stopped primaries, when it ran
    pub recovery: Option<RecoveryReport>,
}

/// Shared context for one run
pub struct RecoverySession {
    config: RecoveryConfig,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn DbConnector>,
    catalog: CatalogReader,
    timestamp: String,
    span: Span,
}

impl RecoverySession {
    pub fn new(
        config: RecoveryConfig,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn DbConnector>,
    ) -> Self {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let catalog = CatalogReader::new(connector.clone(), config.coordinator.db_url());
        let span = info_span!("session", run = %timestamp);
        Self {
            config,
            runner,
            connector,
            catalog,
            timestamp,
            span,
        }
    }

    /// Use a fixed run timestamp (progress file names)
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Log under `span` instead of the default session span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub async fn load_topology(&self) -> Result<ClusterTopology> {
        Ok(self.catalog.load_topology().instrument(self.span.clone()).await?)
    }

    /// Plan without executing
    pub async fn plan(
        &self,
        topology: &ClusterTopology,
        directives: Option<&[RecoveryDirective]>,
    ) -> Result<RecoveryPlan> {
        let resolved = directives
            .map(|ds| confinfo::resolve(ds, topology))
            .transpose()?;
        self.build_plan(topology, resolved.as_deref())
            .instrument(self.span.clone())
            .await
    }

    /// Recover down segments, or only those named by `directives`
    pub async fn recover(
        &self,
        topology: &ClusterTopology,
        directives: Option<&[RecoveryDirective]>,
    ) -> Result<RecoveryReport> {
        let resolved = directives
            .map(|ds| confinfo::resolve(ds, topology))
            .transpose()?;
        self.run_recovery(topology, resolved.as_deref())
            .instrument(self.span.clone())
            .await
    }

    /// Return every unbalanced pair to its preferred roles
    pub async fn rebalance(&self, topology: &ClusterTopology) -> Result<RebalanceReport> {
        self.run_rebalance(topology).instrument(self.span.clone()).await
    }

    /// Compare heap checksum settings of every up segment with the coordinator
    pub async fn verify_checksums(&self, topology: &ClusterTopology) -> Result<ChecksumReport> {
        let segments: Vec<&Segment> = topology.get_seg_db_list();
        let report = self
            .checksum_verifier()
            .verify(topology.coordinator(), &segments)
            .instrument(self.span.clone())
            .await?;
        Ok(report)
    }

    /// Write one directive line per down segment, for editing and `--input-file`
    pub fn write_sample_config(&self, topology: &ClusterTopology, path: impl AsRef<Path>) -> Result<usize> {
        let down = topology.down_segments();
        let text = render_directives(down.iter().map(|s| (*s, None)));
        std::fs::write(path.as_ref(), text)?;
        self.span.in_scope(|| {
            info!(path = %path.as_ref().display(), segments = down.len(), "Wrote sample recovery configuration")
        });
        Ok(down.len())
    }

    fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            force_full: self.config.recovery.force_full,
            force_overwrite: self.config.recovery.force_overwrite,
            log_dir: self.config.paths.log_dir.clone(),
            timestamp: self.timestamp.clone(),
        }
    }

    fn executor_config(&self) -> ExecutorConfig {
        let recovery = &self.config.recovery;
        ExecutorConfig {
            batch_size: recovery.batch_size,
            gphome: self.config.paths.gphome.clone(),
            replication_slot: recovery.replication_slot.clone(),
            show_progress: recovery.show_progress,
            progress_interval: recovery.progress_interval(),
            start_timeout_secs: recovery.start_timeout_secs,
            user: self.config.coordinator.user.clone(),
        }
    }

    fn checksum_verifier(&self) -> HeapChecksumVerifier {
        HeapChecksumVerifier::new(
            self.runner.clone(),
            self.config.checksum.workers,
            self.config.paths.gphome.clone(),
        )
    }

    async fn build_plan(
        &self,
        topology: &ClusterTopology,
        directives: Option<&[ResolvedDirective]>,
    ) -> Result<RecoveryPlan> {
        let candidates = find_candidates(topology, directives);
        let planner = Planner::new(self.planner_config());
        let assessor = TargetAssessor::new(
            self.runner.clone(),
            self.config.recovery.batch_size,
            self.config.paths.gphome.clone(),
        );
        let assessments = assessor
            .assess(&candidates.candidates, planner.needs_timelines())
            .await?;
        Ok(planner.plan(candidates, &assessments))
    }

    async fn run_recovery(
        &self,
        topology: &ClusterTopology,
        directives: Option<&[ResolvedDirective]>,
    ) -> Result<RecoveryReport> {
        let plan = self.build_plan(topology, directives).await?;
        if plan.has_failures() {
            for failure in &plan.failures {
                warn!(dbid = failure.dbid, error = %failure.message, "Segment cannot be recovered");
            }
            return Err(SessionError::Validation(plan.failures));
        }
        if plan.is_empty() {
            info!("No segments to recover");
            return Ok(RecoveryReport::default());
        }
        info!("{}", plan.display());

        let donors: Vec<&Segment> = plan.infos.iter().map(|i| &i.donor).collect();
        let checksums = self.checksum_verifier().verify(topology.coordinator(), &donors).await?;
        HeapChecksumVerifier::validate(&checksums)?;

        let mut infos = plan.infos;
        let mut catalog_failures = Vec::new();
        if infos.iter().any(|i| i.failover) {
            let _mask = SignalMask::acquire();
            let url = self.config.coordinator.dispatch_url();
            for info in infos.iter_mut().filter(|i| i.failover) {
                match relocate_mirror(self.connector.as_ref(), &url, &info.target).await {
                    Ok(dbid) => info.target.dbid = dbid,
                    Err(e) => catalog_failures.push(SegmentFailure::new(
                        info.dbid(),
                        FailureStage::Catalog,
                        e.to_string(),
                    )),
                }
            }
        }
        let failed: HashSet<i32> = catalog_failures.iter().map(|f| f.dbid).collect();
        infos.retain(|i| !failed.contains(&i.dbid()));

        let executor = RecoveryExecutor::new(
            self.runner.clone(),
            self.connector.clone(),
            self.executor_config(),
        );
        let mut report = executor.execute(&infos).await?;
        for failure in catalog_failures {
            report.record_failure(failure);
        }

        self.request_fts_probe().await;
        Ok(report)
    }

    /// Ask the coordinator to notice recovered segments now
    async fn request_fts_probe(&self) {
        let url = self.config.coordinator.dispatch_url();
        if let Err(e) = run_statement(self.connector.as_ref(), &url, FTS_PROBE_SCAN).await {
            warn!(error = %e, "Failed to trigger FTS probe scan");
        }
    }

    async fn run_rebalance(&self, topology: &ClusterTopology) -> Result<RebalanceReport> {
        let batch_size = self.config.recovery.batch_size;
        let mut selection = determine_unbalanced(topology);
        let unbalanced: Vec<SegmentPair> = topology
            .segment_pairs()
            .into_iter()
            .filter(|p| !p.balanced())
            .collect();
        if self.config.rebalance.check_reachability && !unbalanced.is_empty() {
            // only the hosts of pairs that would be touched
            let hosts: Vec<String> = unbalanced
                .iter()
                .flat_map(|p| p.members().map(|s| s.hostname.clone()))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let unreachable = unreachable_hosts(self.runner.clone(), &hosts, batch_size).await?;
            if !unreachable.is_empty() {
                selection = determine_unbalanced(&topology.with_unreachable_hosts(&unreachable));
            }
        }

        let mut op = RebalanceOperation::new(
            self.runner.clone(),
            batch_size,
            self.config.paths.gphome.clone(),
            self.config.rebalance.stop_timeout_secs,
        );
        if !selection.skipped.is_empty() {
            op.mark_partial();
        }
        if selection.is_empty() {
            let outcome = op.finish(false);
            info!(outcome = %outcome, "No pairs to rebalance");
            return Ok(RebalanceReport {
                outcome,
                skipped: selection.skipped,
                stop: StopReport::default(),
                recovery: None,
            });
        }

        let stop = op.stop_primaries(&selection.to_stop).await?;
        if stop.stopped.is_empty() {
            op.mark_partial();
            let outcome = op.finish(false);
            return Ok(RebalanceReport {
                outcome,
                skipped: selection.skipped,
                stop,
                recovery: None,
            });
        }

        {
            let _mask = SignalMask::acquire();
            op.begin_reconfigure();
            SegmentReconfigurer::new(
                self.connector.clone(),
                self.config.coordinator.dispatch_url(),
                self.config.rebalance.reconfigure_timeout(),
            )
            .reconfigure()
            .await?;
        }

        op.begin_resynchronize();
        let refreshed = self.catalog.load_topology().await?;
        let directives: Vec<ResolvedDirective> = stop
            .stopped
            .iter()
            .map(|&dbid| ResolvedDirective {
                dbid,
                relocate_to: None,
            })
            .collect();
        let recovery = match self.run_recovery(&refreshed, Some(&directives)).await {
            Ok(report) => {
                if !report.is_success() {
                    op.mark_partial();
                }
                Some(report)
            }
            Err(SessionError::Validation(failures)) => {
                warn!(error = %failure_lines(&failures), "Stopped primaries could not be recovered");
                op.mark_partial();
                None
            }
            Err(e) => return Err(e),
        };

        let outcome = op.finish(true);
        info!(outcome = %outcome, stopped = stop.stopped.len(), "Rebalance finished");
        Ok(RebalanceReport {
            outcome,
            skipped: selection.skipped,
            stop,
            recovery,
        })
    }
}
