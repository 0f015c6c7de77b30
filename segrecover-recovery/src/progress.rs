//! Progress-file monitoring
//!
//! Base backup and rewind write their progress to a file on the target
//! host. While a stage runs the monitor tails the last line of each file
//! and logs it. Files are only read, never parsed.

use futures::future::join_all;
use segrecover_core::{shell_quote, CommandRunner, RemoteCommand, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::planner::RecoveryInfo;

/// Last progress line, carriage-return updates included
pub fn tail_command(path: &str) -> String {
    let file = shell_quote(path);
    format!("set -o pipefail; touch -a {file}; tail -1 {file} | tr '\\r' '\\n' | tail -1")
}

pub fn remove_command(path: &str) -> String {
    format!("rm -f {}", shell_quote(path))
}

/// Tails progress files while pool work is outstanding
pub struct ProgressMonitor {
    runner: Arc<dyn CommandRunner>,
    interval: Duration,
    enabled: bool,
}

impl ProgressMonitor {
    pub fn new(runner: Arc<dyn CommandRunner>, interval: Duration, enabled: bool) -> Self {
        Self {
            runner,
            interval,
            enabled,
        }
    }

    /// Wait for the pool to drain, logging progress of `tracked` in between
    pub async fn wait(&self, pool: &WorkerPool, tracked: &[&RecoveryInfo]) {
        if !self.enabled || tracked.is_empty() {
            pool.join().await;
            return;
        }
        while !pool.join_timeout(self.interval).await {
            for (info, line) in self.tail_once(tracked).await {
                info!(dbid = info.dbid(), host = %info.target.hostname, "{}", line);
            }
        }
    }

    /// Current last line of each tracked file that has output
    pub async fn tail_once<'a>(&self, tracked: &[&'a RecoveryInfo]) -> Vec<(&'a RecoveryInfo, String)> {
        let reads = tracked.iter().map(|info| {
            let cmd = RemoteCommand::remote(
                "tail progress file",
                tail_command(&info.progress_path()),
                &info.target.hostname,
            );
            let runner = self.runner.clone();
            async move { runner.run(&cmd).await }
        });
        let results = join_all(reads).await;

        tracked
            .iter()
            .zip(results)
            .filter_map(|(info, result)| {
                let line = result.stdout.trim();
                if result.was_successful() && !line.is_empty() {
                    Some((*info, line.to_string()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Best-effort removal of progress files
    pub async fn remove(&self, infos: &[&RecoveryInfo]) {
        let removals = infos.iter().map(|info| {
            let cmd = RemoteCommand::remote(
                "remove progress file",
                remove_command(&info.progress_path()),
                &info.target.hostname,
            );
            let runner = self.runner.clone();
            async move { (cmd.host().map(str::to_string), runner.run(&cmd).await) }
        });
        for (host, result) in join_all(removals).await {
            if result.was_successful() {
                debug!(host = ?host, "Removed progress file");
            } else {
                warn!(host = ?host, error = %result.error_message(), "Failed to remove progress file");
            }
        }
    }
}
