//! Programmatic config creation with builder pattern

use std::path::{Path, PathBuf};

use corral_loader::config::Entry;
use serde_yaml::Value;

/// Builder for declared entry lists
#[derive(Default)]
pub struct TestConfigBuilder {
    entries: Vec<Entry>,
    env_files: Vec<(String, String)>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an always-active entry with no config.
    pub fn add(mut self, id: &str, name: &str) -> Self {
        self.entries.push(Entry::new(id, name));
        self
    }

    /// Add an entry whose config is given as YAML text.
    pub fn add_with_config(mut self, id: &str, name: &str, config: &str) -> Self {
        self.entries
            .push(Entry::new(id, name).with_config(parse_yaml(config)));
        self
    }

    /// Gate the most recently added entry.
    pub fn when(mut self, gate: impl Into<Value>) -> Self {
        if let Some(entry) = self.entries.pop() {
            self.entries.push(entry.with_when(gate.into()));
        }
        self
    }

    /// Write `contents` to `file` (e.g. `.env`) next to the config.
    pub fn with_env_file(mut self, file: &str, contents: &str) -> Self {
        self.env_files.push((file.to_string(), contents.to_string()));
        self
    }

    pub fn build(&self) -> Vec<Entry> {
        self.entries.clone()
    }

    /// Write the entries to `<dir>/corral.yml` and return the path.
    pub fn write_yaml(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let contents = serde_yaml::to_string(&self.entries).map_err(std::io::Error::other)?;
        self.write(dir, "corral.yml", contents)
    }

    /// Write the entries to `<dir>/corral.json` and return the path.
    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let contents =
            serde_json::to_string_pretty(&self.entries).map_err(std::io::Error::other)?;
        self.write(dir, "corral.json", contents)
    }

    fn write(&self, dir: &Path, file: &str, contents: String) -> std::io::Result<PathBuf> {
        for (name, env) in &self.env_files {
            std::fs::write(dir.join(name), env)?;
        }
        let path = dir.join(file);
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

/// Parse YAML text, panicking on malformed test input.
pub fn parse_yaml(text: &str) -> Value {
    match serde_yaml::from_str(text) {
        Ok(value) => value,
        Err(e) => panic!("invalid YAML in test config {:?}: {}", text, e),
    }
}
