//! State carried across worker restarts.
//!
//! The supervisor owns the current value and injects it into each worker's
//! environment as JSON; a worker hands back a replacement with a `Shared`
//! message before it exits for a reload.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::protocol::ENV_SHARED;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedData(Map<String, Value>);

impl SharedData {
    /// Value used before any worker has reported one.
    pub fn initial() -> Self {
        let mut map = Map::new();
        map.insert("startTime".to_string(), Value::from(Utc::now().timestamp_millis()));
        Self(map)
    }

    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Read the blob injected by the supervisor, falling back to
    /// [`SharedData::initial`] when absent or unparsable.
    pub fn from_env() -> Self {
        match std::env::var(ENV_SHARED) {
            Ok(body) => Self::parse(&body).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {}", ENV_SHARED, e);
                Self::initial()
            }),
            Err(_) => Self::initial(),
        }
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Process start time in milliseconds since the epoch, preserved
    /// across reloads.
    pub fn start_time(&self) -> Option<i64> {
        self.0.get("startTime").and_then(Value::as_i64)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }
}

impl Default for SharedData {
    fn default() -> Self {
        Self::initial()
    }
}
