//! segrecover
//!
//! Command-line front end:
//! - `recover`: rebuild failed segments from their peers
//! - `rebalance`: return pairs to their preferred roles
//! - `checksum`: verify heap checksum settings across the cluster
//! - `show`: print the segment configuration

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use segrecover_catalog::PgConnector;
use segrecover_core::{signal::unmasked_ctrl_c, ClusterTopology, ShellRunner};
use segrecover_recovery::{
    parse_confinfo, read_directive_file, CliOverrides, HeapChecksumVerifier, RebalanceOutcome,
    RecoveryConfig, RecoverySession,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "segrecover")]
#[command(about = "Recover and rebalance mirrored database segments", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Coordinator host
    #[arg(long, global = true)]
    coordinator_host: Option<String>,

    /// Coordinator port
    #[arg(long, global = true)]
    coordinator_port: Option<u16>,

    /// Read the segment configuration from a pipe-delimited file instead of the catalog
    #[arg(long, global = true)]
    topology_file: Option<PathBuf>,

    /// Parallel workers per stage
    #[arg(short = 'B', long, global = true, value_parser = clap::value_parser!(u16).range(1..=64))]
    batch_size: Option<u16>,

    /// Directory for log and progress files
    #[arg(short = 'l', long, global = true)]
    log_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the effective configuration and exit
    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover failed segments
    Recover(RecoverArgs),
    /// Return segments to their preferred roles
    Rebalance,
    /// Verify heap checksum settings against the coordinator
    Checksum,
    /// Print the segment configuration
    Show,
}

#[derive(Args, Default)]
struct RecoverArgs {
    /// Segments to recover, `address|port|datadir [new_address|new_port|new_datadir]`, comma separated
    #[arg(long, conflicts_with = "input_file")]
    confinfo: Option<String>,

    /// File with one recovery directive per line
    #[arg(short = 'i', long)]
    input_file: Option<PathBuf>,

    /// Allow full recovery to replace a non-empty target directory
    #[arg(long)]
    force_overwrite: bool,

    /// Always use full recovery
    #[arg(short = 'F', long)]
    force_full: bool,

    /// Timestamp used in progress file names
    #[arg(long)]
    timestamp: Option<String>,

    /// Write a sample directive file for the down segments and exit
    #[arg(short = 'o', long)]
    output_sample_config: Option<PathBuf>,

    /// Do not tail progress files
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "segrecover failed");
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<RecoveryConfig> {
    let base = match &cli.config {
        Some(path) => RecoveryConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => RecoveryConfig::default(),
    };

    let recover = match &cli.command {
        Commands::Recover(args) => Some(args),
        _ => None,
    };
    let config = base.with_env_overrides().with_overrides(CliOverrides {
        coordinator_host: cli.coordinator_host.clone(),
        coordinator_port: cli.coordinator_port,
        batch_size: cli.batch_size.map(usize::from),
        log_dir: cli.log_dir.clone(),
        force_overwrite: recover.map_or(false, |a| a.force_overwrite),
        force_full: recover.map_or(false, |a| a.force_full),
        no_progress: recover.map_or(false, |a| a.no_progress),
    });
    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool, log_dir: &Path) -> Result<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let file_name = format!("segrecover_{}.log", chrono::Local::now().format("%Y%m%d"));
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(guard)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }
    let _guard = init_logging(cli.verbose, &config.paths.log_dir)?;

    let mut session = RecoverySession::new(
        config,
        Arc::new(ShellRunner::default()),
        Arc::new(PgConnector::new()),
    );
    if let Commands::Recover(RecoverArgs {
        timestamp: Some(ts), ..
    }) = &cli.command
    {
        session = session.with_timestamp(ts.clone());
    }

    let topology = match &cli.topology_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ClusterTopology::from_pipe_format(&text)?
        }
        None => session.load_topology().await?,
    };
    topology.check_port_and_directory_conflicts()?;

    tokio::select! {
        code = execute(&session, &topology, &cli.command) => code,
        interrupted = unmasked_ctrl_c() => {
            interrupted?;
            warn!("Interrupted");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn execute(session: &RecoverySession, topology: &ClusterTopology, command: &Commands) -> Result<ExitCode> {
    match command {
        Commands::Recover(args) => recover(session, topology, args).await,
        Commands::Rebalance => {
            let report = session.rebalance(topology).await?;
            if let Some(recovery) = report.recovery.as_ref().filter(|r| !r.is_success()) {
                eprintln!("{}", recovery.error_text());
            }
            match report.outcome {
                RebalanceOutcome::Partial => warn!("The rebalance operation has completed with WARNINGS"),
                outcome => info!(outcome = %outcome, "The rebalance operation has completed successfully"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Checksum => {
            let report = session.verify_checksums(topology).await?;
            println!("{}", report.summary());
            match HeapChecksumVerifier::validate(&report) {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(e) => {
                    eprintln!("{}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Show => {
            print!("{}", topology.to_pipe_format());
            info!(
                segments = topology.get_seg_db_list().len(),
                down = topology.down_segments().len(),
                unbalanced = topology.unbalanced_segments().len(),
                "Segment configuration"
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn recover(session: &RecoverySession, topology: &ClusterTopology, args: &RecoverArgs) -> Result<ExitCode> {
    if let Some(path) = &args.output_sample_config {
        let written = session.write_sample_config(topology, path)?;
        println!("Wrote {} recovery directive(s) to {}", written, path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let directives = match (&args.confinfo, &args.input_file) {
        (Some(confinfo), _) => Some(parse_confinfo(confinfo)?),
        (None, Some(path)) => Some(
            read_directive_file(path).with_context(|| format!("Invalid input file {}", path.display()))?,
        ),
        (None, None) => None,
    };

    let report = session.recover(topology, directives.as_deref()).await?;
    if report.is_success() {
        info!(summary = %report.summary(), "Segment recovery completed");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", report.error_text());
        Ok(ExitCode::FAILURE)
    }
}
