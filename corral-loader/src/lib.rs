//! Worker side of corral.
//!
//! A worker reads a list of declared entries, evaluates each entry's
//! activation gate and `${{ }}` placeholders, and keeps one live plugin
//! instance per active entry inside a [`scope::ScopeTree`]. The
//! [`loader::Loader`] reconciles that tree against the config file, writes
//! edits made from inside instances back to it, and asks the supervisor for a
//! full restart when the root scope goes away.

pub mod addressing;
pub mod config;
pub mod env;
pub mod errors;
pub mod events;
pub mod interpolate;
pub mod loader;
pub mod logger;
pub mod lua_eval;
pub mod plugin;
pub mod scope;
pub mod watcher;
pub mod worker;

pub use config::{ConfigStore, Entry, FileConfigStore};
pub use errors::{LoaderError, Result};
pub use loader::{Loader, LoaderHandle, LoaderOptions, ProcessControl};
pub use plugin::{Plugin, PluginRegistry, Resolver};
pub use scope::{InstanceContext, ScopeHost, ScopeId, ScopeTree};
