use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid log level '{0}': expected a non-negative integer")]
    InvalidLogLevel(String),

    #[error("Invalid heartbeat timeout: {0}")]
    InvalidDuration(String),

    #[error(transparent)]
    Loader(#[from] corral_loader::LoaderError),

    #[error(transparent)]
    Supervisor(#[from] corral_daemon::SupervisorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
