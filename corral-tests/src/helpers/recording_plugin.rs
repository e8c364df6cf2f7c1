//! Plugin that records every lifecycle call

use std::collections::HashMap;

use corral_loader::plugin::Plugin;
use corral_loader::scope::{InstanceContext, ScopeId};
use parking_lot::Mutex;
use serde_yaml::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum PluginCall {
    Apply { scope: ScopeId, config: Value },
    Reconfigure { scope: ScopeId, config: Value },
    Dispose { scope: ScopeId },
}

#[derive(Default)]
pub struct RecordingPlugin {
    calls: Mutex<Vec<PluginCall>>,
    contexts: Mutex<HashMap<ScopeId, InstanceContext>>,
    fail_apply: bool,
    drop_nulls: bool,
}

impl RecordingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plugin whose `apply` always fails.
    pub fn failing() -> Self {
        Self {
            fail_apply: true,
            ..Self::default()
        }
    }

    /// Strip null mapping values when persisting edits.
    pub fn dropping_nulls() -> Self {
        Self {
            drop_nulls: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<PluginCall> {
        self.calls.lock().clone()
    }

    pub fn apply_count(&self) -> usize {
        self.count(|c| matches!(c, PluginCall::Apply { .. }))
    }

    pub fn reconfigure_count(&self) -> usize {
        self.count(|c| matches!(c, PluginCall::Reconfigure { .. }))
    }

    pub fn dispose_count(&self) -> usize {
        self.count(|c| matches!(c, PluginCall::Dispose { .. }))
    }

    fn count(&self, pred: impl Fn(&PluginCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Context of a live instance, for editing its config from inside.
    pub fn context(&self, scope: ScopeId) -> Option<InstanceContext> {
        self.contexts.lock().get(&scope).cloned()
    }
}

impl Plugin for RecordingPlugin {
    fn apply(&self, ctx: &InstanceContext, config: &Value) -> anyhow::Result<()> {
        if self.fail_apply {
            anyhow::bail!("refusing to start");
        }
        self.contexts.lock().insert(ctx.id(), ctx.clone());
        self.calls.lock().push(PluginCall::Apply {
            scope: ctx.id(),
            config: config.clone(),
        });
        Ok(())
    }

    fn reconfigure(&self, ctx: &InstanceContext, config: &Value) -> anyhow::Result<()> {
        self.calls.lock().push(PluginCall::Reconfigure {
            scope: ctx.id(),
            config: config.clone(),
        });
        Ok(())
    }

    fn dispose(&self, ctx: &InstanceContext) {
        self.contexts.lock().remove(&ctx.id());
        self.calls.lock().push(PluginCall::Dispose { scope: ctx.id() });
    }

    fn simplify(&self, config: Value) -> Value {
        match config {
            Value::Mapping(map) if self.drop_nulls => {
                Value::Mapping(map.into_iter().filter(|(_, v)| !v.is_null()).collect())
            }
            other => other,
        }
    }
}
