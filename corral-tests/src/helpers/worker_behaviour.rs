//! Switches for the `test-worker` binary, passed through its environment

use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::Signal;

pub const ENV_SKIP_START: &str = "TEST_WORKER_SKIP_START";
pub const ENV_EXIT_CODE: &str = "TEST_WORKER_EXIT_CODE";
pub const ENV_MAX_SPAWNS: &str = "TEST_WORKER_MAX_SPAWNS";
pub const ENV_SIGNAL: &str = "TEST_WORKER_SIGNAL";
pub const ENV_HEARTBEAT_MS: &str = "TEST_WORKER_HEARTBEAT_MS";
pub const ENV_LINGER_MS: &str = "TEST_WORKER_LINGER_MS";
pub const ENV_HANG_SPAWNS: &str = "TEST_WORKER_HANG_SPAWNS";

/// Shared-data key the worker increments on every spawn.
pub const SPAWNS_KEY: &str = "spawns";

/// What one `test-worker` process does between spawn and exit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerBehaviour {
    /// Never report `start`
    pub skip_start: bool,
    pub exit_code: i32,
    /// Exit 0 once this many spawns have been counted
    pub max_spawns: Option<u64>,
    /// Raise this signal instead of exiting
    pub signal: Option<Signal>,
    /// Heartbeat interval; none means no heartbeats
    pub heartbeat: Option<Duration>,
    /// Time spent running before the exit
    pub linger: Duration,
    /// Block forever while the spawn count is at most this
    pub hang_spawns: u64,
}

impl WorkerBehaviour {
    pub fn exiting(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn signalled(signal: Signal) -> Self {
        Self {
            signal: Some(signal),
            ..Self::default()
        }
    }

    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![(ENV_EXIT_CODE.to_string(), self.exit_code.to_string())];
        if self.skip_start {
            env.push((ENV_SKIP_START.to_string(), "1".to_string()));
        }
        if let Some(max) = self.max_spawns {
            env.push((ENV_MAX_SPAWNS.to_string(), max.to_string()));
        }
        if let Some(signal) = self.signal {
            env.push((ENV_SIGNAL.to_string(), signal.as_str().to_string()));
        }
        if let Some(interval) = self.heartbeat {
            env.push((ENV_HEARTBEAT_MS.to_string(), interval.as_millis().to_string()));
        }
        if !self.linger.is_zero() {
            env.push((ENV_LINGER_MS.to_string(), self.linger.as_millis().to_string()));
        }
        if self.hang_spawns > 0 {
            env.push((ENV_HANG_SPAWNS.to_string(), self.hang_spawns.to_string()));
        }
        env
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            skip_start: std::env::var(ENV_SKIP_START).is_ok_and(|v| v == "1"),
            exit_code: parse_var(ENV_EXIT_CODE)?.unwrap_or(0),
            max_spawns: parse_var(ENV_MAX_SPAWNS)?,
            signal: parse_var(ENV_SIGNAL)?,
            heartbeat: parse_var(ENV_HEARTBEAT_MS)?.map(Duration::from_millis),
            linger: parse_var(ENV_LINGER_MS)?
                .map(Duration::from_millis)
                .unwrap_or_default(),
            hang_spawns: parse_var(ENV_HANG_SPAWNS)?.unwrap_or(0),
        })
    }
}

fn parse_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {}: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}
