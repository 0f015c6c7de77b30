//! Scripted transports for driving whole operations without a cluster

#![allow(dead_code)]

use parking_lot::Mutex;
use segrecover_catalog::{DbConnection, DbConnector, DbError, DbUrl, Result as DbResult};
use segrecover_core::{ClusterTopology, CommandResult, CommandRunner, RemoteCommand};
use segrecover_recovery::RecoveryConfig;
use std::path::Path;
use std::sync::Arc;

/// Healthy two-content cluster, every segment in its preferred role
pub const BALANCED: &str = "\
1|-1|p|p|n|u|cdw|cdw|5432|/data/coordinator/gpseg-1
2|0|p|p|s|u|sdw1|sdw1|6000|/data/primary/gpseg0
4|0|m|m|s|u|sdw2|sdw2|7000|/data/mirror/gpseg0
3|1|p|p|s|u|sdw2|sdw2|6000|/data/primary/gpseg1
5|1|m|m|s|u|sdw1|sdw1|7000|/data/mirror/gpseg1
";

/// Mirror of content 0 is down
pub const MIRROR_DOWN: &str = "\
1|-1|p|p|n|u|cdw|cdw|5432|/data/coordinator/gpseg-1
2|0|p|p|n|u|sdw1|sdw1|6000|/data/primary/gpseg0
4|0|m|m|n|d|sdw2|sdw2|7000|/data/mirror/gpseg0
3|1|p|p|s|u|sdw2|sdw2|6000|/data/primary/gpseg1
5|1|m|m|s|u|sdw1|sdw1|7000|/data/mirror/gpseg1
";

/// Content 0 failed over: its mirror acts as primary
pub const FAILED_OVER: &str = "\
1|-1|p|p|n|u|cdw|cdw|5432|/data/coordinator/gpseg-1
2|0|m|p|s|u|sdw1|sdw1|6000|/data/primary/gpseg0
4|0|p|m|s|u|sdw2|sdw2|7000|/data/mirror/gpseg0
3|1|p|p|s|u|sdw2|sdw2|6000|/data/primary/gpseg1
5|1|m|m|s|u|sdw1|sdw1|7000|/data/mirror/gpseg1
";

/// Catalog after content 0's acting primary was stopped and the
/// original primary promoted
pub const AFTER_PROMOTION: &str = "\
1|-1|p|p|n|u|cdw|cdw|5432|/data/coordinator/gpseg-1
2|0|p|p|n|u|sdw1|sdw1|6000|/data/primary/gpseg0
4|0|m|m|n|d|sdw2|sdw2|7000|/data/mirror/gpseg0
3|1|p|p|s|u|sdw2|sdw2|6000|/data/primary/gpseg1
5|1|m|m|s|u|sdw1|sdw1|7000|/data/mirror/gpseg1
";

pub fn topology(text: &str) -> ClusterTopology {
    ClusterTopology::from_pipe_format(text).unwrap()
}

pub fn catalog_rows(text: &str) -> Vec<Vec<Option<String>>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split('|').map(|f| Some(f.to_string())).collect())
        .collect()
}

/// Config suitable for tests: no progress tailing, no reachability probe
pub fn test_config(log_dir: &Path) -> RecoveryConfig {
    let mut config = RecoveryConfig::default();
    config.paths.log_dir = log_dir.to_path_buf();
    config.paths.gphome = "/usr/local/gpdb".to_string();
    config.recovery.show_progress = false;
    config.rebalance.check_reachability = false;
    config.rebalance.reconfigure_timeout_secs = 5;
    config
}

pub fn controldata(timeline: u32, prev_timeline: u32, checksum: u32) -> String {
    format!(
        "Latest checkpoint's TimeLineID:       {timeline}\n\
         Latest checkpoint's PrevTimeLineID:   {prev_timeline}\n\
         Data page checksum version:           {checksum}\n"
    )
}

/// One executed command, as the runner saw it
#[derive(Debug, Clone)]
pub struct Recorded {
    pub name: String,
    pub host: Option<String>,
    pub cmd_str: String,
    pub dbid: Option<i32>,
}

type Script = Box<dyn Fn(&RemoteCommand) -> Option<CommandResult> + Send + Sync>;

/// Answers commands by name; anything not scripted succeeds with the
/// default behavior of a healthy cluster
pub struct ScriptedRunner {
    script: Script,
    pub directory_state: &'static str,
    commands: Mutex<Vec<Recorded>>,
}

impl ScriptedRunner {
    pub fn healthy() -> Self {
        Self::with_script(|_| None)
    }

    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&RemoteCommand) -> Option<CommandResult> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            directory_state: "nonempty",
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn directory(mut self, state: &'static str) -> Self {
        self.directory_state = state;
        self
    }

    pub fn commands(&self) -> Vec<Recorded> {
        self.commands.lock().clone()
    }

    pub fn named(&self, name: &str) -> Vec<Recorded> {
        self.commands().into_iter().filter(|c| c.name == name).collect()
    }

    fn default_result(&self, cmd: &RemoteCommand) -> CommandResult {
        match cmd.name.as_str() {
            "probe target directory" => CommandResult::success(format!("{}\n", self.directory_state)),
            "read target control data" => CommandResult::success(controldata(1, 0, 1)),
            "read donor control data" => CommandResult::success(controldata(2, 1, 1)),
            "read heap checksum setting" => CommandResult::success(controldata(2, 1, 1)),
            "stop unbalanced primaries" => CommandResult::success(stop_markers(&cmd.cmd_str, "stopped")),
            _ => CommandResult::success(""),
        }
    }
}

/// `stopped:N` (or `failed:N`) for every segment a stop command covers
pub fn stop_markers(cmd_str: &str, verdict: &str) -> String {
    cmd_str
        .split("then echo stopped:")
        .skip(1)
        .filter_map(|rest| rest.split(';').next())
        .map(|dbid| format!("{}:{}\n", verdict, dbid.trim()))
        .collect()
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &RemoteCommand) -> CommandResult {
        self.commands.lock().push(Recorded {
            name: cmd.name.clone(),
            host: cmd.host().map(str::to_string),
            cmd_str: cmd.cmd_str.clone(),
            dbid: cmd.dbid,
        });
        (self.script)(cmd).unwrap_or_else(|| self.default_result(cmd))
    }
}

/// Dbid the catalog hands out to a relocated mirror
pub const RELOCATED_DBID: i32 = 9;

/// SQL side of the cluster: serves catalog rows and records statements
pub struct MockConnector {
    catalog: Mutex<Vec<Vec<Option<String>>>>,
    statements: Arc<Mutex<Vec<(String, String)>>>,
    pub fail_checkpoint: bool,
}

impl MockConnector {
    pub fn new(catalog: &str) -> Self {
        Self {
            catalog: Mutex::new(catalog_rows(catalog)),
            statements: Arc::new(Mutex::new(Vec::new())),
            fail_checkpoint: false,
        }
    }

    /// Serve `text` from now on, as if the catalog had been updated
    pub fn set_catalog(&self, text: &str) {
        *self.catalog.lock() = catalog_rows(text);
    }

    pub fn statements(&self) -> Vec<(String, String)> {
        self.statements.lock().clone()
    }

    pub fn ran(&self, fragment: &str) -> bool {
        self.statements().iter().any(|(_, sql)| sql.contains(fragment))
    }
}

#[async_trait::async_trait]
impl DbConnector for MockConnector {
    async fn connect(&self, url: &DbUrl) -> DbResult<Box<dyn DbConnection>> {
        Ok(Box::new(MockConnection {
            url: url.to_string(),
            catalog: self.catalog.lock().clone(),
            statements: self.statements.clone(),
            fail_checkpoint: self.fail_checkpoint,
        }))
    }
}

struct MockConnection {
    url: String,
    catalog: Vec<Vec<Option<String>>>,
    statements: Arc<Mutex<Vec<(String, String)>>>,
    fail_checkpoint: bool,
}

#[async_trait::async_trait]
impl DbConnection for MockConnection {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.statements.lock().push((self.url.clone(), sql.to_string()));
        if self.fail_checkpoint && sql == "CHECKPOINT" {
            return Err(DbError::Query("could not checkpoint".to_string()));
        }
        Ok(0)
    }

    async fn query_rows(&mut self, sql: &str) -> DbResult<Vec<Vec<Option<String>>>> {
        self.statements.lock().push((self.url.clone(), sql.to_string()));
        if sql.contains("gp_segment_configuration") {
            Ok(self.catalog.clone())
        } else if sql.contains("gp_add_segment_mirror") {
            Ok(vec![vec![Some(RELOCATED_DBID.to_string())]])
        } else {
            Ok(vec![vec![Some("1".to_string())]])
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}
