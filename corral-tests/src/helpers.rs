pub mod config_builder;
pub mod loader_harness;
pub mod recording_plugin;
pub mod wait_utils;
pub mod worker_behaviour;
