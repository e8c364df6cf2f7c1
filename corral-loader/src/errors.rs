use std::path::PathBuf;
use thiserror::Error;

use crate::scope::ScopeId;

/// Format a YAML error for user-friendly display, including the field path
fn format_yaml_error(e: &serde_path_to_error::Error<serde_yaml::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let msg = inner.to_string();

    let located = if let Some(loc) = inner.location() {
        format!("Line {}, Column {}: {}", loc.line(), loc.column(), msg)
    } else {
        msg
    };

    if path.is_empty() || path == "." {
        located
    } else {
        format!("{}: {}", path, located)
    }
}

fn format_json_error(e: &serde_path_to_error::Error<serde_json::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let located = format!("Line {}, Column {}: {}", inner.line(), inner.column(), inner);
    if path.is_empty() || path == "." {
        located
    } else {
        format!("{}: {}", path, located)
    }
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file '{path}':\n  {}", format_yaml_error(.source))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("Failed to parse config file '{path}':\n  {}", format_json_error(.source))]
    ConfigParseJson {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_json::Error>,
    },

    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Config file {0} is read-only")]
    ReadOnlyConfig(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse environment file {path}: {source}")]
    EnvFileParse {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("Lua error: {message}")]
    Lua { message: String },

    #[error("Expression error in ${{{{ {expr} }}}}: {message}")]
    Expression { expr: String, message: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin {name} failed: {source}")]
    Plugin {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Unknown scope {0}")]
    UnknownScope(ScopeId),

    #[error("Invalid worker options in {var}: {source}")]
    WorkerOptions {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("File watcher error: {0}")]
    Watcher(String),

    #[error("IPC error: {0}")]
    Channel(#[from] corral_protocol::errors::ChannelError),

    #[error("Loader is not running")]
    LoaderClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LoaderError>;
