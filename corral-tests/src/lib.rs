//! Test utilities for the corral workspace
//!
//! Builders for config files, a plugin that records its lifecycle, a loader
//! harness backed by a temporary config directory, and the behaviour switches
//! understood by the `test-worker` binary.

pub mod helpers;

pub use helpers::config_builder::TestConfigBuilder;
pub use helpers::loader_harness::{LoaderHarness, RecordingControl};
pub use helpers::recording_plugin::{PluginCall, RecordingPlugin};
pub use helpers::wait_utils::{wait_for, wait_for_event};
pub use helpers::worker_behaviour::WorkerBehaviour;
