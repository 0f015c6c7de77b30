//! Recovery execution
//!
//! Runs a recovery plan in strictly ordered stages, each one a batch of
//! commands on a shared worker pool:
//! 1. first base backup attempt for full recoveries; donor CHECKPOINT and
//!    target process check for incremental ones
//! 2. base backup retry (creating the replication slot) for failed first
//!    attempts; rewind for incremental targets that passed the check
//! 3. start every recovered segment
//!
//! A segment that fails at any stage is dropped from later stages while its
//! siblings continue.

use futures::future::join_all;
use segrecover_catalog::{run_statement, DbConnector, DbUrl};
use segrecover_core::{shell_quote, CommandRunner, PoolError, RemoteCommand, WorkerPool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::planner::{RecoveryInfo, RecoveryKind};
use crate::progress::ProgressMonitor;
use crate::report::{FailureStage, RecoveryReport, SegmentFailure};

const BASE_BACKUP: &str = "run pg_basebackup";
const BASE_BACKUP_RETRY: &str = "run pg_basebackup with slot creation";
const PROCESS_CHECK: &str = "check target process";
const REWIND: &str = "run pg_rewind";
const START: &str = "start segment";

/// Application name the rewind source connection identifies itself with
pub const REWIND_APPLICATION_NAME: &str = "__gprecoverseg_pg_rewind__";

/// Exit status of the process check when the target is still running
pub const PROCESS_RUNNING_RC: i32 = 3;

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub batch_size: usize,
    pub gphome: String,
    pub replication_slot: String,
    pub show_progress: bool,
    pub progress_interval: Duration,
    pub start_timeout_secs: u64,
    /// Role used for the donor CHECKPOINT connection
    pub user: Option<String>,
}

/// Runs recovery plans
pub struct RecoveryExecutor {
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn DbConnector>,
    config: ExecutorConfig,
}

impl RecoveryExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn DbConnector>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runner,
            connector,
            config,
        }
    }

    /// Execute every planned recovery and account for each segment
    #[instrument(skip(self, infos), fields(segments = infos.len()))]
    pub async fn execute(&self, infos: &[RecoveryInfo]) -> Result<RecoveryReport, PoolError> {
        let started = Instant::now();
        let mut report = RecoveryReport::default();
        if infos.is_empty() {
            return Ok(report);
        }

        let workers = self.config.batch_size.min(infos.len()).max(1);
        let pool = WorkerPool::new(workers, self.runner.clone())?;
        let monitor = ProgressMonitor::new(
            self.runner.clone(),
            self.config.progress_interval,
            self.config.show_progress,
        );

        let outcome = self.run_stages(&pool, &monitor, infos, &mut report).await;
        pool.shutdown().await;
        outcome?;

        let succeeded: Vec<&RecoveryInfo> = infos
            .iter()
            .filter(|i| report.succeeded.contains(&i.dbid()))
            .collect();
        monitor.remove(&succeeded).await;

        report.duration = started.elapsed();
        info!(summary = %report.summary(), "Recovery finished");
        Ok(report)
    }

    async fn run_stages(
        &self,
        pool: &WorkerPool,
        monitor: &ProgressMonitor,
        infos: &[RecoveryInfo],
        report: &mut RecoveryReport,
    ) -> Result<(), PoolError> {
        let by_dbid: HashMap<i32, &RecoveryInfo> = infos.iter().map(|i| (i.dbid(), i)).collect();
        let (full, incremental): (Vec<&RecoveryInfo>, Vec<&RecoveryInfo>) =
            infos.iter().partition(|i| i.kind == RecoveryKind::Full);

        // Stage 1
        info!(full = full.len(), incremental = incremental.len(), "Starting recovery");
        for info in &full {
            pool.submit(self.base_backup(info, false)).await?;
        }
        for failure in self.checkpoint_donors(&incremental).await {
            report.record_failure(failure);
        }
        for info in incremental.iter().filter(|i| !report.is_failed(i.dbid())) {
            pool.submit(self.process_check(info)).await?;
        }
        monitor.wait(pool, &full).await;

        let mut retries = Vec::new();
        for cmd in pool.take_completed_items() {
            let Some(dbid) = cmd.dbid else { continue };
            let error = cmd.result().map(|r| r.error_message()).unwrap_or_default();
            match cmd.name.as_str() {
                BASE_BACKUP if !cmd.was_successful() => {
                    warn!(dbid, error = %error, "Base backup failed, retrying with slot creation");
                    retries.extend(by_dbid.get(&dbid).copied());
                }
                PROCESS_CHECK if !cmd.was_successful() => {
                    report.record_failure(SegmentFailure::new(dbid, FailureStage::ProcessCheck, error));
                }
                _ => {}
            }
        }
        pool.empty_completed_items();

        // Stage 2
        let rewinds: Vec<&RecoveryInfo> = incremental
            .iter()
            .copied()
            .filter(|i| !report.is_failed(i.dbid()))
            .collect();
        for info in &retries {
            pool.submit(self.base_backup(info, true)).await?;
        }
        for info in &rewinds {
            pool.submit(self.rewind(info)).await?;
        }
        let tracked: Vec<&RecoveryInfo> = retries.iter().chain(rewinds.iter()).copied().collect();
        monitor.wait(pool, &tracked).await;

        for cmd in pool.take_completed_items() {
            let Some(dbid) = cmd.dbid else { continue };
            if cmd.was_successful() {
                continue;
            }
            let stage = if cmd.name == REWIND {
                FailureStage::Rewind
            } else {
                FailureStage::BaseBackup
            };
            let error = cmd.result().map(|r| r.error_message()).unwrap_or_default();
            report.record_failure(SegmentFailure::new(dbid, stage, error));
        }
        pool.empty_completed_items();

        // Stage 3
        let to_start: Vec<&RecoveryInfo> = infos.iter().filter(|i| !report.is_failed(i.dbid())).collect();
        info!(segments = to_start.len(), "Starting recovered segments");
        for info in &to_start {
            pool.submit(self.start(info)).await?;
        }
        pool.join().await;

        for cmd in pool.take_completed_items() {
            let Some(dbid) = cmd.dbid else { continue };
            if cmd.was_successful() {
                report.record_success(dbid);
            } else {
                let error = cmd.result().map(|r| r.error_message()).unwrap_or_default();
                report.record_failure(SegmentFailure::new(dbid, FailureStage::Start, error));
            }
        }
        Ok(())
    }

    /// CHECKPOINT every donor concurrently so its control file carries the
    /// current timeline before rewind reads it
    async fn checkpoint_donors(&self, infos: &[&RecoveryInfo]) -> Vec<SegmentFailure> {
        let checkpoints = infos.iter().map(|info| {
            let url = DbUrl::new(&info.donor.address, info.donor.port, "template1")
                .utility()
                .with_user(self.config.user.clone());
            let connector = self.connector.clone();
            async move { run_statement(connector.as_ref(), &url, "CHECKPOINT").await }
        });

        infos
            .iter()
            .zip(join_all(checkpoints).await)
            .filter_map(|(info, outcome)| {
                outcome.err().map(|e| {
                    warn!(dbid = info.dbid(), donor = %info.donor.location(), error = %e, "Donor checkpoint failed");
                    SegmentFailure::new(info.dbid(), FailureStage::Checkpoint, e.to_string())
                })
            })
            .collect()
    }

    fn base_backup(&self, info: &RecoveryInfo, retry: bool) -> RemoteCommand {
        let target = &info.target;
        let dir = shell_quote(&target.datadir);
        let progress = shell_quote(&info.progress_path());

        let mut cmd = log_dir_prefix(&info.progress_file);
        if retry || info.clear_target {
            cmd.push_str(&format!("rm -rf {dir} && mkdir -p {dir} && chmod 700 {dir} && "));
        }
        cmd.push_str(&format!(
            "$GPHOME/bin/pg_basebackup -c fast -D {dir} -h {} -p {} -R --wal-method=stream --slot={}",
            shell_quote(&info.donor.hostname),
            info.donor.port,
            shell_quote(&self.config.replication_slot),
        ));
        if retry {
            cmd.push_str(" --create-slot --force-overwrite");
        }
        let redirect = if retry { ">>" } else { ">" };
        cmd.push_str(&format!(
            " --target-gp-dbid {} --progress --verbose -E ./db_dumps -E ./promote {redirect} {progress} 2>&1{}",
            target.dbid,
            tail_on_failure(&progress)
        ));

        let name = if retry { BASE_BACKUP_RETRY } else { BASE_BACKUP };
        RemoteCommand::remote(name, cmd, &target.hostname)
            .with_gphome(&self.config.gphome)
            .for_dbid(target.dbid)
    }

    /// Refuse to touch a target whose postmaster is alive; otherwise remove
    /// its stale pid file
    fn process_check(&self, info: &RecoveryInfo) -> RemoteCommand {
        let pidfile = shell_quote(&format!("{}/postmaster.pid", info.target.datadir));
        let cmd = format!(
            "PIDFILE={pidfile}; if [ -f \"$PIDFILE\" ]; then PID=$(head -1 \"$PIDFILE\"); \
             if [ -n \"$PID\" ] && ps -p \"$PID\" -o comm= 2>/dev/null | grep -q postgres; then \
             echo \"segment process $PID is still running\" >&2; exit {PROCESS_RUNNING_RC}; fi; \
             rm -f \"$PIDFILE\"; fi"
        );
        RemoteCommand::remote(PROCESS_CHECK, cmd, &info.target.hostname).for_dbid(info.dbid())
    }

    fn rewind(&self, info: &RecoveryInfo) -> RemoteCommand {
        let dir = shell_quote(&info.target.datadir);
        let progress = shell_quote(&info.progress_path());
        let source = format!(
            "host={} port={} dbname=template1 application_name={}",
            info.donor.hostname, info.donor.port, REWIND_APPLICATION_NAME
        );
        let cmd = format!(
            "{}[ -f {}/recovery.conf ] || {{ PGOPTIONS='-c gp_role=utility' $GPHOME/bin/pg_rewind \
             --write-recovery-conf --slot={} --source-server={} --target-pgdata={dir} --progress \
             > {progress} 2>&1{}; }}",
            log_dir_prefix(&info.progress_file),
            dir,
            shell_quote(&self.config.replication_slot),
            shell_quote(&source),
            tail_on_failure(&progress)
        );
        RemoteCommand::remote(REWIND, cmd, &info.target.hostname)
            .with_gphome(&self.config.gphome)
            .for_dbid(info.dbid())
    }

    fn start(&self, info: &RecoveryInfo) -> RemoteCommand {
        let target = &info.target;
        let dir = shell_quote(&target.datadir);
        let logfile = shell_quote(&format!("{}/log/startup.log", target.datadir));
        let cmd = format!(
            "mkdir -p {}/log && $GPHOME/bin/pg_ctl -D {dir} -l {logfile} -w -t {} -o {} start",
            dir,
            self.config.start_timeout_secs,
            shell_quote(&format!("-p {}", target.port))
        );
        RemoteCommand::remote(START, cmd, &target.hostname)
            .with_gphome(&self.config.gphome)
            .for_dbid(target.dbid)
    }
}

fn log_dir_prefix(progress_file: &Path) -> String {
    match progress_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            format!("mkdir -p {} && ", shell_quote(&parent.to_string_lossy()))
        }
        _ => String::new(),
    }
}

/// On failure, surface the last lines of the progress file on stderr
fn tail_on_failure(progress: &str) -> String {
    format!(" || {{ rc=$?; tail -n 5 {progress} >&2; exit $rc; }}")
}
