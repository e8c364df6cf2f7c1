use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("message of {0} bytes exceeds the maximum frame size")]
    MessageTooLarge(usize),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{name} is not set; the worker was not started by a supervisor")]
    MissingFd { name: &'static str },

    #[error("invalid IPC descriptor in {name}: {value:?}")]
    InvalidFd { name: &'static str, value: String },

    #[error("failed to open IPC pipe: {0}")]
    Open(#[source] std::io::Error),

    #[error("IPC channel closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
