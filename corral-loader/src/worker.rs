//! Worker process runtime.
//!
//! Wires the config store, scope tree and engine together, reports to the
//! supervisor over the inherited pipe and keeps the heartbeat going.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use corral_protocol::channel::WorkerChannel;
use corral_protocol::protocol::{DaemonConfig, ENV_IPC_FD, ENV_LOADER_OPTIONS, WorkerMessage};
use corral_protocol::shared::SharedData;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigStore, FileConfigStore};
use crate::errors::{LoaderError, Result};
use crate::loader::{Loader, LoaderOptions, ProcessControl};
use crate::logger::{self, LoggerConfig};
use crate::plugin::Resolver;
use crate::scope::{ScopeHost, ScopeTree};
use crate::watcher::spawn_config_watcher;

/// Root service carrying the recent log records.
pub const SERVICE_PROLOG: &str = "prolog";
/// Root service carrying the data handed to the next worker.
pub const SERVICE_SHARED: &str = "shared";

/// Default config file stem.
pub const DEFAULT_CONFIG_NAME: &str = "corral";

fn default_name() -> String {
    DEFAULT_CONFIG_NAME.to_string()
}

fn default_watch() -> bool {
    true
}

/// Settings passed from the CLI to every worker it spawns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    /// Config file stem searched for in directories
    #[serde(default = "default_name")]
    pub name: String,
    /// Config file or directory; the current directory when absent
    #[serde(default)]
    pub config: Option<PathBuf>,
    /// Snapshot reported back in the `start` message
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Reconcile when the config or env files change
    #[serde(default = "default_watch")]
    pub watch: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            config: None,
            daemon: DaemonConfig::default(),
            logger: LoggerConfig::default(),
            watch: true,
        }
    }
}

impl WorkerOptions {
    /// Options from `CORRAL_LOADER_OPTIONS`, defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(ENV_LOADER_OPTIONS) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|source| LoaderError::WorkerOptions {
            var: ENV_LOADER_OPTIONS,
            source,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| LoaderError::WorkerOptions {
            var: ENV_LOADER_OPTIONS,
            source,
        })
    }
}

/// Full reload over IPC: hand the shared data to the supervisor, then exit.
pub struct IpcProcessControl {
    channel: Option<WorkerChannel>,
    shared: Arc<Mutex<SharedData>>,
}

impl IpcProcessControl {
    pub fn new(channel: Option<WorkerChannel>, shared: Arc<Mutex<SharedData>>) -> Self {
        Self { channel, shared }
    }

    /// Send the current shared data and wait until it is on the pipe.
    pub async fn flush_shared(&self) {
        let Some(channel) = &self.channel else {
            return;
        };
        let body = self.shared.lock().to_json();
        if let Err(e) = channel.send_and_flush(&WorkerMessage::Shared { body }).await {
            warn!("Failed to hand shared data to supervisor: {}", e);
        }
    }
}

#[async_trait]
impl ProcessControl for IpcProcessControl {
    async fn full_reload(&self, code: i32) {
        self.flush_shared().await;
        info!("Exiting with code {} for full reload", code);
        std::process::exit(code);
    }
}

/// Pulse the supervisor every `interval` until the pipe closes.
pub fn spawn_heartbeat(channel: WorkerChannel, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = channel.send(&WorkerMessage::Heartbeat).await {
                debug!("Heartbeat stopped: {}", e);
                break;
            }
        }
    })
}

/// Pipe to the supervisor, if this worker is supervised.
fn supervisor_channel() -> Result<Option<WorkerChannel>> {
    if std::env::var_os(ENV_IPC_FD).is_none() {
        return Ok(None);
    }
    Ok(Some(WorkerChannel::from_env()?))
}

/// Boot a worker and serve until shutdown or full reload.
///
/// Returns the process exit code: 0 after SIGINT/SIGTERM, the requested
/// code after a full reload.
pub async fn run_worker(
    options: WorkerOptions,
    resolver: Arc<dyn Resolver>,
    argv: Vec<String>,
) -> Result<i32> {
    let prolog = logger::init(&options.logger);
    let shared = Arc::new(Mutex::new(SharedData::from_env()));
    let channel = supervisor_channel()?;

    let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::discover(
        options.config.as_deref(),
        &options.name,
    )?);
    let (tree, scope_events) = ScopeTree::new();
    tree.provide(SERVICE_PROLOG, prolog);
    tree.provide(SERVICE_SHARED, shared.clone());

    let control = Arc::new(IpcProcessControl::new(channel.clone(), shared));
    let mut loader = Loader::new(LoaderOptions {
        store: store.clone(),
        host: tree,
        scope_events,
        resolver,
        control,
        argv,
    })?;

    loader.start().await?;

    let watcher = options.watch.then(|| {
        spawn_config_watcher(
            store.base_dir().to_path_buf(),
            store.watch_paths(),
            loader.change_sender(),
        )
    });

    let heartbeat = match &channel {
        Some(channel) => {
            channel
                .send(&WorkerMessage::Start {
                    config: options.daemon.clone(),
                })
                .await?;
            options
                .daemon
                .heartbeat_interval()
                .map(|interval| spawn_heartbeat(channel.clone(), interval))
        }
        None => None,
    };

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let code = tokio::select! {
        code = loader.run() => Some(code),
        _ = sigint.recv() => None,
        _ = sigterm.recv() => None,
    };

    if let Some(handle) = watcher {
        handle.abort();
    }
    if let Some(handle) = heartbeat {
        handle.abort();
    }

    match code {
        Some(code) => Ok(code),
        None => {
            info!("Shutting down");
            loader.shutdown();
            Ok(0)
        }
    }
}

/// Entry point for the `worker` subcommand.
pub async fn run_from_env(resolver: Arc<dyn Resolver>, argv: Vec<String>) -> i32 {
    let options = match WorkerOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    match run_worker(options, resolver, argv).await {
        Ok(code) => code,
        Err(e) => {
            error!("Worker failed: {}", e);
            1
        }
    }
}
