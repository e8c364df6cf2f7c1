use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ProtocolError;

/// Maximum frame payload (1MB). Shared data is expected to stay tiny.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Exit code a worker uses to ask for a full reload; the supervisor respawns it.
pub const EXIT_CODE_FULL_RELOAD: i32 = 51;

/// Exit code a worker uses to ask for a restart that also ends the supervisor.
pub const EXIT_CODE_RESTART_AND_EXIT: i32 = 52;

/// Environment variable carrying the inherited IPC pipe descriptor.
pub const ENV_IPC_FD: &str = "CORRAL_IPC_FD";

/// Environment variable carrying the serialized shared data blob.
pub const ENV_SHARED: &str = "CORRAL_SHARED";

/// Environment variable carrying the serialized worker options.
pub const ENV_LOADER_OPTIONS: &str = "CORRAL_LOADER_OPTIONS";

/// Supervisor settings, fixed for the lifetime of one supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Extra arguments appended to every worker invocation
    #[serde(default)]
    pub exec_argv: Vec<String>,
    /// Kill the worker if no heartbeat arrives within this window after
    /// `start`. Milliseconds when serialized.
    #[serde(default, with = "crate::duration::optional_millis")]
    pub heartbeat_timeout: Option<Duration>,
    /// Respawn the worker after an unrecognized exit
    #[serde(default)]
    pub auto_restart: bool,
}

impl DaemonConfig {
    /// Interval at which a worker should pulse so that one lost heartbeat
    /// never trips the timeout.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_timeout.map(|timeout| timeout / 2)
    }
}

/// Message sent from a worker to its supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Worker finished booting; arms the heartbeat timer
    Start { config: DaemonConfig },
    /// Replacement shared data (JSON text) for the next spawn
    Shared { body: String },
    /// Liveness pulse
    Heartbeat,
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Start { .. } => "start",
            WorkerMessage::Shared { .. } => "shared",
            WorkerMessage::Heartbeat => "heartbeat",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Encode a worker message to length-prefixed bincode bytes
pub fn encode_message(msg: &WorkerMessage) -> Result<Vec<u8>> {
    let size = bincode::serialized_size(msg).map_err(ProtocolError::Encode)?;
    if size > MAX_MESSAGE_SIZE as u64 {
        return Err(ProtocolError::MessageTooLarge(size as usize));
    }
    let len = size as u32;
    let mut frame = Vec::with_capacity(4 + size as usize);
    frame.extend_from_slice(&len.to_be_bytes());
    bincode::serialize_into(&mut frame, msg).map_err(ProtocolError::Encode)?;
    Ok(frame)
}

/// Decode a worker message from raw bincode payload (framing already stripped)
pub fn decode_message(bytes: &[u8]) -> Result<WorkerMessage> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}
