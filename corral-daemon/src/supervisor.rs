//! Worker supervision loop.
//!
//! One supervisor owns one worker at a time. It reads the worker's messages,
//! enforces the heartbeat deadline, and decides after every exit whether to
//! respawn or to end with the same status.

use std::time::Duration;

use corral_protocol::protocol::{DaemonConfig, WorkerMessage};
use corral_protocol::shared::SharedData;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::errors::{Result, SupervisorError};
use crate::restart::{WorkerExit, should_exit};
use crate::spawn::{SpawnedWorker, WorkerSpec, spawn_worker};

/// How long to keep reading after the worker exited, for messages still in
/// the pipe.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Supervisor lifecycle.
enum Phase {
    Spawning,
    Running(Box<SpawnedWorker>),
    Respawning(WorkerExit),
    Terminating(WorkerExit),
}

/// What one worker lifetime produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub started: bool,
    pub exit: WorkerExit,
}

/// Signals relayed from the supervisor to the running worker.
struct Forwarder {
    int: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

impl Forwarder {
    fn install() -> Result<Self> {
        let install = |kind| signal(kind).map_err(SupervisorError::Signal);
        Ok(Self {
            int: install(SignalKind::interrupt())?,
            term: install(SignalKind::terminate())?,
            hup: install(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.int.recv() => Signal::SIGINT,
            _ = self.term.recv() => Signal::SIGTERM,
            _ = self.hup.recv() => Signal::SIGHUP,
        }
    }
}

async fn next_forwarded(forwarder: &mut Option<Forwarder>) -> Signal {
    match forwarder {
        Some(f) => f.recv().await,
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct Supervisor {
    spec: WorkerSpec,
    config: DaemonConfig,
    shared: SharedData,
    forward_signals: bool,
    spawns: usize,
}

impl Supervisor {
    pub fn new(spec: WorkerSpec, config: DaemonConfig) -> Self {
        Self {
            spec,
            config,
            shared: SharedData::initial(),
            forward_signals: false,
            spawns: 0,
        }
    }

    /// Relay SIGINT, SIGTERM and SIGHUP to the worker.
    pub fn forward_signals(mut self, enabled: bool) -> Self {
        self.forward_signals = enabled;
        self
    }

    /// Data the next worker will be started with.
    pub fn shared(&self) -> &SharedData {
        &self.shared
    }

    /// Number of workers launched so far.
    pub fn spawns(&self) -> usize {
        self.spawns
    }

    /// Spawn workers until one ends in a way that ends the supervisor, and
    /// return how that last worker ended.
    pub async fn run(&mut self) -> Result<WorkerExit> {
        let mut forwarder = if self.forward_signals {
            Some(Forwarder::install()?)
        } else {
            None
        };

        let mut phase = Phase::Spawning;
        loop {
            phase = match phase {
                Phase::Spawning => {
                    self.spawns += 1;
                    Phase::Running(Box::new(spawn_worker(&self.spec, &self.shared)?))
                }
                Phase::Running(worker) => {
                    let outcome = self.supervise(*worker, &mut forwarder).await?;
                    if should_exit(outcome.started, &outcome.exit, self.config.auto_restart) {
                        Phase::Terminating(outcome.exit)
                    } else {
                        Phase::Respawning(outcome.exit)
                    }
                }
                Phase::Respawning(exit) => {
                    info!("Worker exited with {}, restarting", exit);
                    Phase::Spawning
                }
                Phase::Terminating(exit) => {
                    info!("Worker exited with {}", exit);
                    return Ok(exit);
                }
            };
        }
    }

    /// Watch one worker until it exits.
    async fn supervise(
        &mut self,
        worker: SpawnedWorker,
        forwarder: &mut Option<Forwarder>,
    ) -> Result<Outcome> {
        let SpawnedWorker {
            mut child,
            mut reader,
        } = worker;
        let mut started = false;
        let mut deadline: Option<Instant> = None;
        let mut reader_open = true;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(SupervisorError::Wait)?,
                msg = reader.next(), if reader_open => match msg {
                    Some(msg) => self.on_message(msg, &mut started, &mut deadline),
                    None => reader_open = false,
                },
                _ = expire(deadline) => {
                    warn!("No heartbeat from worker, killing it");
                    deadline = None;
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill worker: {}", e);
                    }
                }
                sig = next_forwarded(forwarder) => {
                    if let Some(pid) = child.id() {
                        debug!("Forwarding {} to worker", sig);
                        let _ = kill(Pid::from_raw(pid as i32), sig);
                    }
                }
            }
        };

        // A full reload writes `shared` right before exiting
        if reader_open {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while let Some(msg) = reader.next().await {
                    self.on_message(msg, &mut started, &mut deadline);
                }
            })
            .await;
        }

        Ok(Outcome {
            started,
            exit: WorkerExit::from_status(status),
        })
    }

    fn on_message(
        &mut self,
        msg: WorkerMessage,
        started: &mut bool,
        deadline: &mut Option<Instant>,
    ) {
        debug!("Worker message: {}", msg.kind());
        match msg {
            WorkerMessage::Start { .. } => {
                *started = true;
                *deadline = self.config.heartbeat_timeout.map(|t| Instant::now() + t);
            }
            WorkerMessage::Shared { body } => match SharedData::parse(&body) {
                Ok(shared) => self.shared = shared,
                Err(e) => warn!("Ignoring malformed shared data from worker: {}", e),
            },
            WorkerMessage::Heartbeat => {
                if deadline.is_some() {
                    *deadline = self.config.heartbeat_timeout.map(|t| Instant::now() + t);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
