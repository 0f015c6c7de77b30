//! Worker Pool
//!
//! Bounded-concurrency executor for `RemoteCommand`s:
//! - N worker tasks pull from one bounded queue
//! - Every submitted command ends up with a result, including failures and panics
//! - `join` waits for the queue to drain, `halt_work` stops new work from starting
//!
//! One pool is created per orchestration stage and torn down with
//! `shutdown`, which halts and waits for every worker to exit.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::command::{CommandResult, CommandRunner, RemoteCommand};

/// Queue slots reserved per worker before `submit` starts waiting
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// Worker pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    #[error("Worker pool has been halted")]
    Halted,

    #[error("Command '{name}' failed{}: {message}", on_host(.host))]
    CommandFailed {
        name: String,
        host: Option<String>,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, PoolError>;

fn on_host(host: &Option<String>) -> String {
    host.as_ref().map(|h| format!(" on {}", h)).unwrap_or_default()
}

/// State shared between the pool handle and its workers
struct Shared {
    completed: Mutex<Vec<RemoteCommand>>,
    /// Commands submitted but not yet completed
    pending: watch::Sender<usize>,
    halted: AtomicBool,
}

impl Shared {
    fn complete(&self, cmd: RemoteCommand) {
        self.completed.lock().push(cmd);
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Bounded pool of command workers
pub struct WorkerPool {
    num_workers: usize,
    sender: Mutex<Option<mpsc::Sender<RemoteCommand>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Start `num_workers` workers. Must be called from within a tokio runtime.
    pub fn new(num_workers: usize, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        if num_workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (tx, rx) = mpsc::channel(num_workers * QUEUE_DEPTH_PER_WORKER);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (pending, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            completed: Mutex::new(Vec::new()),
            pending,
            halted: AtomicBool::new(false),
        });

        let workers = (0..num_workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    rx.clone(),
                    runner.clone(),
                    shared.clone(),
                ))
            })
            .collect();

        debug!(num_workers, "Worker pool started");

        Ok(Self {
            num_workers,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shared,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Commands submitted whose results are not in yet
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    /// Enqueue a command. Waits only while the bounded queue is full.
    pub async fn submit(&self, cmd: RemoteCommand) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(PoolError::Halted)?;

        self.shared.pending.send_modify(|n| *n += 1);
        if sender.send(cmd).await.is_err() {
            self.shared.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(PoolError::Halted);
        }
        Ok(())
    }

    /// Wait until every submitted command has a result
    pub async fn join(&self) {
        let mut rx = self.shared.pending.subscribe();
        // The sender lives in `shared`, so this only errors if the pool is gone
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// `join` bounded by `timeout`; returns true when everything finished
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.join()).await.is_ok()
    }

    /// Stop workers from starting new commands. Commands still queued are
    /// completed as halted; in-flight commands run to completion.
    pub fn halt_work(&self) {
        if !self.shared.halted.swap(true, Ordering::SeqCst) {
            debug!("Worker pool halted");
        }
        // Dropping the sender lets workers exit once the queue is empty
        self.sender.lock().take();
    }

    /// Wait for every worker task to exit. Call after `halt_work`.
    pub async fn join_workers(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Halt and wait for all workers
    pub async fn shutdown(self) {
        self.halt_work();
        self.join_workers().await;
        debug!("Worker pool shut down");
    }

    /// Snapshot of every completed command
    pub fn completed_items(&self) -> Vec<RemoteCommand> {
        self.shared.completed.lock().clone()
    }

    /// Take completed commands out of the pool
    pub fn take_completed_items(&self) -> Vec<RemoteCommand> {
        std::mem::take(&mut *self.shared.completed.lock())
    }

    /// Discard completed commands so a later stage does not see them
    pub fn empty_completed_items(&self) {
        self.shared.completed.lock().clear();
    }

    /// First failed command among the completed items, as an error
    pub fn check_results(&self) -> Result<()> {
        let completed = self.shared.completed.lock();
        match completed.iter().find(|c| !c.was_successful()) {
            Some(cmd) => Err(PoolError::CommandFailed {
                name: cmd.name.clone(),
                host: cmd.host().map(str::to_string),
                message: cmd
                    .result()
                    .map(CommandResult::error_message)
                    .unwrap_or_else(|| "no result recorded".to_string()),
            }),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.halt_work();
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RemoteCommand>>>,
    runner: Arc<dyn CommandRunner>,
    shared: Arc<Shared>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(mut cmd) = next else {
            break;
        };

        if shared.halted.load(Ordering::SeqCst) {
            cmd.set_result(CommandResult::halted());
            shared.complete(cmd);
            continue;
        }

        // Run on its own task so a panicking runner fails only this command
        let task_runner = runner.clone();
        let task_cmd = cmd.clone();
        let result = match tokio::spawn(async move { task_runner.run(&task_cmd).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(worker = id, name = %cmd.name, error = %e, "Command dispatch failed");
                CommandResult::transport_failure(format!("command dispatch failed: {}", e))
            }
        };

        if !result.was_successful() {
            debug!(worker = id, name = %cmd.name, host = ?cmd.host(), rc = result.rc, "Command failed");
        }
        cmd.set_result(result);
        shared.complete(cmd);
    }
    debug!(worker = id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Runner scripted by command string: `ok`, `fail`, `panic` or `sleep:<ms>`
    struct ScriptedRunner {
        started: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &RemoteCommand) -> CommandResult {
            self.started.fetch_add(1, Ordering::SeqCst);
            match cmd.cmd_str.as_str() {
                "ok" => CommandResult::success("done"),
                "fail" => CommandResult::new(1, "", "failed"),
                "panic" => panic!("runner blew up"),
                other => {
                    let ms = other
                        .strip_prefix("sleep:")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    CommandResult::success("slept")
                }
            }
        }
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let err = WorkerPool::new(0, ScriptedRunner::new()).err();
        assert_eq!(err, Some(PoolError::NoWorkers));
    }

    #[tokio::test]
    async fn test_pool_drains_fully() {
        let pool = WorkerPool::new(4, ScriptedRunner::new()).unwrap();
        for i in 0..25 {
            let script = match i % 5 {
                0 => "fail",
                1 => "panic",
                2 => "sleep:5",
                _ => "ok",
            };
            pool.submit(RemoteCommand::local(format!("cmd{}", i), script).for_dbid(i))
                .await
                .unwrap();
        }
        pool.join().await;

        let items = pool.completed_items();
        assert_eq!(items.len(), 25);
        assert_eq!(pool.pending(), 0);
        assert!(items.iter().all(|c| c.result().is_some()));
        assert_eq!(items.iter().filter(|c| c.was_successful()).count(), 15);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let runner = ScriptedRunner::new();
        let pool = WorkerPool::new(1, runner.clone()).unwrap();
        pool.submit(RemoteCommand::local("first", "fail")).await.unwrap();
        pool.submit(RemoteCommand::local("second", "ok")).await.unwrap();
        pool.submit(RemoteCommand::local("third", "ok")).await.unwrap();
        pool.join().await;

        assert_eq!(runner.started.load(Ordering::SeqCst), 3);
        let items = pool.take_completed_items();
        let second = items.iter().find(|c| c.name == "second").unwrap();
        assert!(second.was_successful());
        assert!(pool.completed_items().is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_check_results_reports_failure() {
        let pool = WorkerPool::new(2, ScriptedRunner::new()).unwrap();
        pool.submit(RemoteCommand::remote("stop", "fail", "sdw3")).await.unwrap();
        pool.join().await;
        let err = pool.check_results().unwrap_err();
        assert_eq!(err.to_string(), "Command 'stop' failed on sdw3: failed");

        pool.empty_completed_items();
        assert!(pool.check_results().is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_halt_rejects_new_work() {
        let pool = WorkerPool::new(2, ScriptedRunner::new()).unwrap();
        pool.halt_work();
        let err = pool.submit(RemoteCommand::local("late", "ok")).await.unwrap_err();
        assert_eq!(err, PoolError::Halted);
        pool.join_workers().await;
        assert!(pool.is_halted());
    }

    #[tokio::test]
    async fn test_halt_marks_queued_commands() {
        let runner = ScriptedRunner::new();
        let pool = WorkerPool::new(1, runner.clone()).unwrap();
        pool.submit(RemoteCommand::local("slow", "sleep:50")).await.unwrap();
        for i in 0..3 {
            pool.submit(RemoteCommand::local(format!("queued{}", i), "ok"))
                .await
                .unwrap();
        }
        // Let the worker pick up the slow command before halting
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.halt_work();
        pool.join().await;

        let items = pool.completed_items();
        assert_eq!(items.len(), 4);
        let halted = items
            .iter()
            .filter(|c| c.result().map_or(false, |r| r.halted))
            .count();
        assert_eq!(halted, 3);
        assert_eq!(runner.started.load(Ordering::SeqCst), 1);
        pool.join_workers().await;
    }

    #[tokio::test]
    async fn test_join_timeout() {
        let pool = WorkerPool::new(1, ScriptedRunner::new()).unwrap();
        pool.submit(RemoteCommand::local("slow", "sleep:200")).await.unwrap();
        assert!(!pool.join_timeout(Duration::from_millis(10)).await);
        assert!(pool.join_timeout(Duration::from_secs(5)).await);
        pool.shutdown().await;
    }
}
