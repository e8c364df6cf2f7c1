use std::path::PathBuf;
use thiserror::Error;

use corral_protocol::errors::ChannelError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to create IPC pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("Failed to spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Cannot determine current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("IPC error: {0}")]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
