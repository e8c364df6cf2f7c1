//! Plugin implementations and the registry entries resolve against.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_yaml::Value;
use tracing::info;

use crate::errors::{LoaderError, Result};
use crate::scope::InstanceContext;

/// A loadable implementation. One plugin object backs every instance
/// created from it; `ctx` tells the instances apart.
pub trait Plugin: Send + Sync {
    /// Bring up a new instance with its interpolated config.
    fn apply(&self, ctx: &InstanceContext, config: &Value) -> anyhow::Result<()>;

    /// Push a new config into a live instance.
    fn reconfigure(&self, _ctx: &InstanceContext, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tear down an instance. Called at most once per instance.
    fn dispose(&self, _ctx: &InstanceContext) {}

    /// Reduce a config to the form worth persisting.
    fn simplify(&self, config: Value) -> Value {
        config
    }
}

/// Import collaborator: maps an entry's `name` to an implementation.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn Plugin>>;
}

const SCOPED_PREFIX: &str = "@corral/plugin-";
const PACKAGE_PREFIX: &str = "corral-plugin-";

/// Short registry key for a plugin name: `corral-plugin-foo` and
/// `@corral/plugin-foo` both map to `foo`.
pub fn key_for(name: &str) -> &str {
    name.strip_prefix(SCOPED_PREFIX)
        .or_else(|| name.strip_prefix(PACKAGE_PREFIX))
        .unwrap_or(name)
}

/// In-process resolver backed by a name table.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("log", Arc::new(LogPlugin));
        registry
    }

    pub fn register(&self, name: impl Into<String>, plugin: Arc<dyn Plugin>) {
        self.plugins.write().insert(name.into(), plugin);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let plugins = self.plugins.read();
        plugins
            .get(name)
            .or_else(|| plugins.get(key_for(name)))
            .cloned()
    }
}

#[async_trait]
impl Resolver for PluginRegistry {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.lookup(name)
            .ok_or_else(|| LoaderError::PluginNotFound(name.to_string()))
    }
}

/// Logs every lifecycle step of its instances.
pub struct LogPlugin;

fn render(config: &Value) -> String {
    serde_json::to_string(config).unwrap_or_else(|_| format!("{:?}", config))
}

impl Plugin for LogPlugin {
    fn apply(&self, ctx: &InstanceContext, config: &Value) -> anyhow::Result<()> {
        info!(target: "corral::log", scope = %ctx.id(), "apply {}", render(config));
        Ok(())
    }

    fn reconfigure(&self, ctx: &InstanceContext, config: &Value) -> anyhow::Result<()> {
        info!(target: "corral::log", scope = %ctx.id(), "reconfigure {}", render(config));
        Ok(())
    }

    fn dispose(&self, ctx: &InstanceContext) {
        info!(target: "corral::log", scope = %ctx.id(), "dispose");
    }
}
