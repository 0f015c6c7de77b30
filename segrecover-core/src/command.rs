//! Remote command execution
//!
//! A `RemoteCommand` is one shell-level operation run either locally or on a
//! segment host over ssh. Each command owns its result once it has run.
//! Transport is pluggable through `CommandRunner`; `ShellRunner` is the
//! production implementation built on `tokio::process`.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Return code recorded when the command could not be started at all
pub const TRANSPORT_FAILURE_RC: i32 = 255;

/// ssh banner seen when sshd drops a connection under load
const SSH_EXCHANGE_ERROR: &str = "ssh_exchange_identification: Connection closed by remote host";

/// Maximum number of retries on transient ssh exchange failures
pub const SSH_MAX_RETRY: u32 = 10;

/// Delay between ssh retries
pub const SSH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where a command runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    Local,
    Remote { host: String },
}

/// Outcome of a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    /// The command ran to completion (as opposed to never being started)
    pub completed: bool,
    /// The pool was halted before the command could start
    pub halted: bool,
    pub elapsed: Duration,
}

impl CommandResult {
    pub fn new(rc: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            rc,
            stdout: stdout.into(),
            stderr: stderr.into(),
            completed: true,
            halted: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn success(stdout: impl Into<String>) -> Self {
        Self::new(0, stdout, "")
    }

    /// A transport-level failure: the command never produced an exit status
    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self {
            completed: false,
            ..Self::new(TRANSPORT_FAILURE_RC, "", message)
        }
    }

    /// Result recorded for work skipped after the pool was halted
    pub fn halted() -> Self {
        Self {
            completed: false,
            halted: true,
            ..Self::new(1, "", "command halted before execution")
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn was_successful(&self) -> bool {
        self.completed && !self.halted && self.rc == 0
    }

    /// Best single-line description of why the command failed
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exited with code {}", self.rc)
    }
}

/// One unit of work for the worker pool
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub name: String,
    pub cmd_str: String,
    pub ctx: ExecutionContext,
    /// Install directory whose `greenplum_path.sh` is sourced before running
    pub gphome: Option<String>,
    /// Segment this command acts on, for per-segment accounting
    pub dbid: Option<i32>,
    result: Option<CommandResult>,
}

impl RemoteCommand {
    pub fn local(name: impl Into<String>, cmd_str: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd_str: cmd_str.into(),
            ctx: ExecutionContext::Local,
            gphome: None,
            dbid: None,
            result: None,
        }
    }

    pub fn remote(
        name: impl Into<String>,
        cmd_str: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            ctx: ExecutionContext::Remote { host: host.into() },
            ..Self::local(name, cmd_str)
        }
    }

    /// Run locally when `host` is `None`, otherwise over ssh
    pub fn on(name: impl Into<String>, cmd_str: impl Into<String>, host: Option<&str>) -> Self {
        match host {
            Some(h) => Self::remote(name, cmd_str, h),
            None => Self::local(name, cmd_str),
        }
    }

    pub fn with_gphome(mut self, gphome: impl Into<String>) -> Self {
        self.gphome = Some(gphome.into());
        self
    }

    pub fn for_dbid(mut self, dbid: i32) -> Self {
        self.dbid = Some(dbid);
        self
    }

    pub fn host(&self) -> Option<&str> {
        match &self.ctx {
            ExecutionContext::Local => None,
            ExecutionContext::Remote { host } => Some(host),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.ctx, ExecutionContext::Remote { .. })
    }

    pub fn set_result(&mut self, result: CommandResult) {
        self.result = Some(result);
    }

    pub fn result(&self) -> Option<&CommandResult> {
        self.result.as_ref()
    }

    pub fn was_successful(&self) -> bool {
        self.result.as_ref().map_or(false, CommandResult::was_successful)
    }

    /// Command string with environment sourcing applied, before ssh wrapping
    pub fn prepared_command(&self) -> String {
        match &self.gphome {
            Some(gphome) => format!(". {}/greenplum_path.sh; {}", gphome, self.cmd_str),
            None => self.cmd_str.clone(),
        }
    }

    /// Full string handed to `bash -c`
    pub fn full_command_string(&self) -> String {
        let prepared = self.prepared_command();
        match &self.ctx {
            ExecutionContext::Local => prepared,
            ExecutionContext::Remote { host } => format!(
                "ssh -o 'StrictHostKeyChecking no' {} \"{}\"",
                shell_quote(host),
                escape_double_quoted(&prepared)
            ),
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cmdStr='{}'", self.name, self.cmd_str)?;
        if let Some(host) = self.host() {
            write!(f, " host={}", host)?;
        }
        if let Some(result) = &self.result {
            write!(f, " rc={}", result.rc)?;
            if !result.was_successful() {
                write!(f, " error='{}'", result.error_message())?;
            }
        }
        Ok(())
    }
}

/// Quote a value for safe interpolation into a POSIX shell command
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\"'\"'"))
    }
}

/// Escape a command so it survives one level of double quoting.
/// `$` is escaped as well so variables expand on the remote side.
fn escape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// =============================================================================
// TRAITS FOR DEPENDENCY INJECTION
// =============================================================================

/// Transport used by the worker pool to execute commands
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run the command and report its outcome. Transport errors are
    /// reported through the result, never by panicking.
    async fn run(&self, cmd: &RemoteCommand) -> CommandResult;
}

/// Runs commands with `/bin/bash -c`, wrapping remote ones in ssh
#[derive(Debug, Clone)]
pub struct ShellRunner {
    pub ssh_max_retry: u32,
    pub ssh_retry_delay: Duration,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            ssh_max_retry: SSH_MAX_RETRY,
            ssh_retry_delay: SSH_RETRY_DELAY,
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &RemoteCommand) -> CommandResult {
        let start = Instant::now();
        let script = cmd.full_command_string();
        let mut attempt = 0;

        loop {
            debug!(name = %cmd.name, host = ?cmd.host(), attempt, "Running command");

            let output = tokio::process::Command::new("/bin/bash")
                .arg("-c")
                .arg(&script)
                .stdin(Stdio::null())
                .output()
                .await;

            let output = match output {
                Ok(o) => o,
                Err(e) => {
                    return CommandResult::transport_failure(format!(
                        "failed to spawn command: {}",
                        e
                    ))
                    .with_elapsed(start.elapsed());
                }
            };

            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if cmd.is_remote()
                && stderr.contains(SSH_EXCHANGE_ERROR)
                && attempt < self.ssh_max_retry
            {
                attempt += 1;
                warn!(host = ?cmd.host(), attempt, "ssh connection closed by remote host, retrying");
                tokio::time::sleep(self.ssh_retry_delay).await;
                continue;
            }

            // A missing exit code means the process was killed by a signal
            let rc = output.status.code().unwrap_or(TRANSPORT_FAILURE_RC);
            return CommandResult::new(rc, String::from_utf8_lossy(&output.stdout), stderr)
                .with_elapsed(start.elapsed());
        }
    }
}
