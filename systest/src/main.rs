//! System test runner.
//!
//! `systest run` supervises worker processes; each worker drives whole test
//! modules through their lifecycle and reports one JSON line per module.

#![forbid(unsafe_code)]

mod plan;
mod signals;
mod supervisor;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use systest_common::{HarnessConfig, LogConfig, init_logging};
use tracing::debug;

#[derive(Parser)]
#[command(name = "systest")]
#[command(author, version, about = "System test runner - module lifecycle orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Options shared by every command that runs modules.
#[derive(Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Don't remove the temporary test directories with artifacts
    #[arg(long)]
    pub noclean: bool,

    /// Shell interpreter (overrides $SHELL)
    #[arg(long)]
    pub shell: Option<PathBuf>,

    /// Secondary script interpreter (overrides $PERL)
    #[arg(long)]
    pub perl: Option<PathBuf>,

    /// Only run modules whose id contains one of these strings
    pub filters: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test modules, optionally across several worker processes
    Run {
        /// Number of worker processes
        #[arg(
            short = 'n',
            long,
            default_value = "1",
            value_parser = clap::value_parser!(u16).range(1..)
        )]
        workers: u16,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Run the share of the schedule owned by one worker (used by `run`)
    #[command(hide = true)]
    Worker {
        #[arg(long, default_value = "0")]
        worker_index: usize,

        #[arg(long, default_value = "1")]
        worker_count: usize,

        /// Skip the stale workspace sweep (the supervisor already did it)
        #[arg(long)]
        skip_sweep: bool,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Print the port range assigned to every module
    Ports,

    /// Print the scheduled module order
    List {
        /// Show the worker each module would run on
        #[arg(short = 'n', long)]
        workers: Option<u16>,

        /// Only list modules whose id contains one of these strings
        filters: Vec<String>,
    },
}

fn load_config(options: &RunOptions) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::from_env()
        .context("failed to load configuration")?
        .with_keep_artifacts(options.noclean);
    if let Some(shell) = &options.shell {
        config = config.with_shell(shell);
    }
    if let Some(perl) = &options.perl {
        config = config.with_perl(perl);
    }
    debug!(root = %config.root.display(), keep = config.keep_artifacts, "configuration ready");
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Workers print reports on stdout, so logs always go to stderr.
    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Run { workers, options } => {
            let mut config = load_config(&options)?;
            config.check_interpreters()?;
            supervisor::run(config, options, usize::from(workers), cli.verbose).await
        }
        Commands::Worker {
            worker_index,
            worker_count,
            skip_sweep,
            options,
        } => {
            let mut config = load_config(&options)?;
            config.check_interpreters()?;
            worker::run(config, &options.filters, worker_index, worker_count, skip_sweep).await
        }
        Commands::Ports => {
            let config = load_config(&RunOptions::default())?;
            plan::print_ports(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List { workers, filters } => {
            let config = load_config(&RunOptions::default())?;
            plan::print_schedule(&config, &filters, workers.map(usize::from))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
