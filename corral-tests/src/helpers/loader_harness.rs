//! Test harness that drives a loader against a real config file

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use corral_loader::config::{ConfigStore, Entry, FileConfigStore};
use corral_loader::loader::{Loader, LoaderOptions, ProcessControl};
use corral_loader::plugin::{Plugin, PluginRegistry};
use corral_loader::scope::ScopeTree;
use parking_lot::Mutex;
use tempfile::TempDir;

use super::config_builder::TestConfigBuilder;

/// Process control that records requested exit codes instead of exiting.
#[derive(Default)]
pub struct RecordingControl {
    codes: Mutex<Vec<i32>>,
}

impl RecordingControl {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().clone()
    }
}

#[async_trait]
impl ProcessControl for RecordingControl {
    async fn full_reload(&self, code: i32) {
        self.codes.lock().push(code);
    }
}

/// Loader wired to a temp config directory, an empty process environment and
/// a plugin registry the test fills in.
pub struct LoaderHarness {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub tree: Arc<ScopeTree>,
    pub registry: Arc<PluginRegistry>,
    pub control: Arc<RecordingControl>,
    pub loader: Loader,
}

impl LoaderHarness {
    /// Write `builder` as YAML and build a loader over it.
    pub fn yaml(builder: &TestConfigBuilder) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = builder.write_yaml(dir.path())?;
        Self::from_file(dir, path, Vec::new())
    }

    /// Write `builder` as JSON and build a loader over it.
    pub fn json(builder: &TestConfigBuilder) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = builder.write_json(dir.path())?;
        Self::from_file(dir, path, Vec::new())
    }

    /// Build a loader over an existing config file inside `dir`.
    pub fn from_file(
        dir: TempDir,
        config_path: PathBuf,
        argv: Vec<String>,
    ) -> std::io::Result<Self> {
        let store = FileConfigStore::open(&config_path)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Self::with_store(dir, store, argv)
    }

    /// Build a loader over `store`, replacing its captured environment with
    /// an empty one.
    pub fn with_store(
        dir: TempDir,
        store: FileConfigStore,
        argv: Vec<String>,
    ) -> std::io::Result<Self> {
        let store = store.with_initial_env(HashMap::new());
        let config_path = store.path().to_path_buf();

        let (tree, scope_events) = ScopeTree::new();
        let registry = Arc::new(PluginRegistry::new());
        let control = Arc::new(RecordingControl::default());
        let loader = Loader::new(LoaderOptions {
            store: Arc::new(store),
            host: tree.clone(),
            scope_events,
            resolver: registry.clone(),
            control: control.clone(),
            argv,
        })
        .map_err(|e| std::io::Error::other(e.to_string()))?;

        Ok(Self {
            dir,
            config_path,
            tree,
            registry,
            control,
            loader,
        })
    }

    pub fn register(&self, name: &str, plugin: Arc<dyn Plugin>) {
        self.registry.register(name, plugin);
    }

    pub fn config_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Entries as currently persisted on disk.
    pub fn read_entries(&self) -> Vec<Entry> {
        match self.loader.store().read() {
            Ok(entries) => entries,
            Err(e) => panic!("failed to read {}: {}", self.config_path.display(), e),
        }
    }

    /// Overwrite the config file with `builder`'s entries, keeping the format.
    pub fn rewrite(&self, builder: &TestConfigBuilder) -> std::io::Result<()> {
        match self.config_path.extension().and_then(|e| e.to_str()) {
            Some("json") => builder.write_json(self.dir.path())?,
            _ => builder.write_yaml(self.dir.path())?,
        };
        Ok(())
    }
}
