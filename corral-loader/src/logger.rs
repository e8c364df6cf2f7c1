//! Worker logging: level mapping, per-target debug overrides and the
//! in-memory prolog of recent records.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Subscriber, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Number of records the prolog keeps.
pub const PROLOG_CAPACITY: usize = 1000;

/// Default base level (info).
pub const DEFAULT_LEVEL: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    /// 0 off, 1 error, 2 info, 3 debug, 4 and above trace
    #[serde(default = "default_level")]
    pub level: u8,
    /// Targets forced to debug regardless of `level`
    #[serde(default)]
    pub debug: Vec<String>,
    /// Prefix records with a timestamp
    #[serde(default)]
    pub show_time: bool,
}

fn default_level() -> u8 {
    DEFAULT_LEVEL
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            debug: Vec::new(),
            show_time: false,
        }
    }
}

pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Build the filter for `config`; `RUST_LOG` directives are layered on top
/// of the base level.
pub fn build_filter(config: &LoggerConfig) -> EnvFilter {
    let mut filter =
        EnvFilter::from_default_env().add_directive(level_filter(config.level).into());
    for target in config.debug.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        match format!("{}=debug", target).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => warn!("Ignoring invalid debug target '{}': {}", target, e),
        }
    }
    filter
}

#[derive(Debug, Clone)]
pub struct PrologRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl fmt::Display for PrologRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>5} {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.target,
            self.message
        )
    }
}

/// Bounded buffer of the most recent log records.
#[derive(Debug)]
pub struct Prolog {
    records: Mutex<VecDeque<PrologRecord>>,
    capacity: usize,
}

impl Prolog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(PROLOG_CAPACITY))),
            capacity,
        }
    }

    pub fn push(&self, record: PrologRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<PrologRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for Prolog {
    fn default() -> Self {
        Self::new(PROLOG_CAPACITY)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Layer copying every enabled event into a [`Prolog`].
pub struct PrologLayer {
    prolog: Arc<Prolog>,
}

impl PrologLayer {
    pub fn new(prolog: Arc<Prolog>) -> Self {
        Self { prolog }
    }
}

impl<S: Subscriber> Layer<S> for PrologLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.prolog.push(PrologRecord {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// Install the global subscriber for a worker and return its prolog.
///
/// A subscriber that is already installed is left in place.
pub fn init(config: &LoggerConfig) -> Arc<Prolog> {
    let prolog = Arc::new(Prolog::default());
    let timed = config
        .show_time
        .then(|| tracing_subscriber::fmt::layer().with_target(true));
    let untimed = (!config.show_time)
        .then(|| tracing_subscriber::fmt::layer().with_target(true).without_time());

    let _ = tracing_subscriber::registry()
        .with(timed)
        .with(untimed)
        .with(PrologLayer::new(prolog.clone()))
        .with(build_filter(config))
        .try_init();

    prolog
}
