use std::path::PathBuf;

use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the application described by a config file
    Start(StartArgs),

    /// Run a worker process (spawned by `start`)
    #[command(hide = true)]
    Worker {
        /// Arguments exposed to expressions as `argv`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Config file, or a directory containing corral.yaml / corral.yml / corral.json
    pub file: Option<PathBuf>,

    /// Log level: 0 off, 1 error, 2 info, 3 debug, 4 trace
    #[arg(long, allow_hyphen_values = true, value_name = "N")]
    pub log_level: Option<String>,

    /// Targets to log at debug level regardless of --log-level
    #[arg(long, value_delimiter = ',', value_name = "TARGETS")]
    pub debug: Vec<String>,

    /// Prefix log lines with a timestamp
    #[arg(long)]
    pub log_time: bool,

    /// Kill the worker if it misses heartbeats for this long (e.g. 5s, 500ms;
    /// a bare number is milliseconds)
    #[arg(long, value_name = "DURATION")]
    pub heartbeat_timeout: Option<String>,

    /// Restart the worker after an unexpected exit
    #[arg(long)]
    pub auto_restart: bool,

    /// Run the worker in this process, without a supervisor
    #[arg(long)]
    pub no_daemon: bool,

    /// Extra arguments passed through to the worker
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}
