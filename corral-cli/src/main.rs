mod commands;
mod errors;

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use corral_daemon::{Supervisor, WorkerSpec, exit_like};
use corral_loader::logger::{self, DEFAULT_LEVEL, LoggerConfig};
use corral_loader::plugin::PluginRegistry;
use corral_loader::worker::{self, WorkerOptions};
use corral_protocol::duration::parse_duration;
use corral_protocol::protocol::DaemonConfig;
use tracing::debug;

use crate::commands::{Commands, StartArgs};
use crate::errors::{CliError, Result};

/// corral - keeps a plugin application running from a declarative config
#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Start(args) => match start(args).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                1
            }
        },
        Commands::Worker { args } => {
            worker::run_from_env(Arc::new(PluginRegistry::with_builtins()), args).await
        }
    };
    std::process::exit(code);
}

fn parse_log_level(raw: Option<&str>) -> Result<u8> {
    match raw {
        None => Ok(DEFAULT_LEVEL),
        Some(raw) => raw
            .trim()
            .parse::<u8>()
            .map_err(|_| CliError::InvalidLogLevel(raw.to_string())),
    }
}

/// Turn `start` arguments into worker options.
fn worker_options(args: &StartArgs) -> Result<WorkerOptions> {
    let logger = LoggerConfig {
        level: parse_log_level(args.log_level.as_deref())?,
        debug: args.debug.clone(),
        show_time: args.log_time,
    };
    let heartbeat_timeout = args
        .heartbeat_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(CliError::InvalidDuration)?;
    let config = match &args.file {
        Some(path) => Some(std::path::absolute(path)?),
        None => None,
    };

    Ok(WorkerOptions {
        config,
        daemon: DaemonConfig {
            exec_argv: args.args.clone(),
            heartbeat_timeout,
            auto_restart: args.auto_restart,
        },
        logger,
        ..WorkerOptions::default()
    })
}

async fn start(args: StartArgs) -> Result<i32> {
    let options = worker_options(&args)?;

    if args.no_daemon {
        let registry = Arc::new(PluginRegistry::with_builtins());
        return Ok(worker::run_worker(options, registry, args.args).await?);
    }

    logger::init(&options.logger);
    let spec = WorkerSpec::current_exe(options.daemon.exec_argv.clone(), options.to_json()?)?;
    debug!("Supervising {}", spec.program.display());
    let mut supervisor = Supervisor::new(spec, options.daemon.clone()).forward_signals(true);
    let exit = supervisor.run().await?;
    exit_like(&exit)
}

#[cfg(test)]
mod tests;
