//! Declared entries and the file-backed store they are read from.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use nix::unistd::{AccessFlags, access};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::env::{ENV_FILES, merge_env_files};
use crate::errors::{LoaderError, Result};

/// One declared module instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable join key between the declaration and the live instance
    pub id: String,
    /// Implementation to resolve
    pub name: String,
    #[serde(default)]
    pub config: Value,
    /// Activation gate; absent means always active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Value>,
}

impl Entry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config: Value::Null,
            when: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_when(mut self, when: Value) -> Self {
        self.when = Some(when);
        self
    }
}

/// Source of the declared entry list.
pub trait ConfigStore: Send + Sync {
    fn read(&self) -> Result<Vec<Entry>>;

    /// Persist the whole list. Fails with `ReadOnlyConfig` when the source
    /// cannot be written.
    fn write(&self, entries: &[Entry]) -> Result<()>;

    /// Variables visible to `${{ }}` expressions.
    fn env(&self) -> HashMap<String, String>;

    /// Directory relative paths in the config resolve against.
    fn base_dir(&self) -> &Path;

    /// Files whose modification should trigger a re-read.
    fn watch_paths(&self) -> Vec<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

/// Extensions tried during discovery, in order.
pub const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("json") => Ok(ConfigFormat::Json),
            _ => Err(LoaderError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Entries stored in a YAML or JSON file whose top level is a sequence.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    base_dir: PathBuf,
    format: ConfigFormat,
    writable: bool,
    initial_env: HashMap<String, String>,
    /// Items from the last read that did not yield an entry, by position
    skipped: Mutex<Vec<(usize, Value)>>,
}

impl FileConfigStore {
    /// Open an explicit config file.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(LoaderError::ConfigNotFound(path.to_path_buf()));
        }
        let format = ConfigFormat::from_path(path)?;
        let path = path.canonicalize().map_err(|source| LoaderError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let writable = access(&path, AccessFlags::W_OK).is_ok();
        debug!("Using config {} (writable: {})", path.display(), writable);

        Ok(Self {
            path,
            base_dir,
            format,
            writable,
            initial_env: std::env::vars().collect(),
            skipped: Mutex::new(Vec::new()),
        })
    }

    /// Open a config file that is never written back.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.writable = false;
        Ok(store)
    }

    /// Resolve a config from a file or directory argument, falling back to
    /// the current directory. Directories are searched for `<name>.yaml`,
    /// `<name>.yml` and `<name>.json`, in that order.
    pub fn discover(target: Option<&Path>, name: &str) -> Result<Self> {
        let dir = match target {
            Some(path) if path.is_dir() => path.to_path_buf(),
            Some(path) => return Self::open(path),
            None => std::env::current_dir()?,
        };

        for ext in CONFIG_EXTENSIONS {
            let candidate = dir.join(format!("{}.{}", name, ext));
            if candidate.is_file() {
                return Self::open(&candidate);
            }
        }
        Err(LoaderError::ConfigNotFound(dir.join(format!("{}.yaml", name))))
    }

    /// Replace the captured process environment.
    pub fn with_initial_env(mut self, env: HashMap<String, String>) -> Self {
        self.initial_env = env;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ConfigFormat {
        self.format
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Parse the top-level sequence. Items are kept raw so one malformed
    /// entry cannot hide the others.
    fn parse(&self, contents: &str) -> Result<Vec<Value>> {
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        match self.format {
            ConfigFormat::Yaml => {
                let de = serde_yaml::Deserializer::from_str(contents);
                serde_path_to_error::deserialize(de).map_err(|source| LoaderError::ConfigParse {
                    path: self.path.clone(),
                    source,
                })
            }
            ConfigFormat::Json => {
                let mut de = serde_json::Deserializer::from_str(contents);
                serde_path_to_error::deserialize(&mut de).map_err(|source| {
                    LoaderError::ConfigParseJson {
                        path: self.path.clone(),
                        source,
                    }
                })
            }
        }
    }
}

/// Split raw items into usable entries and the positions of the ones that
/// were skipped. An item is skipped when it does not deserialize or its id is
/// empty or already taken; the first holder of an id wins.
pub fn split_entries(items: Vec<Value>, origin: &Path) -> (Vec<Entry>, Vec<(usize, Value)>) {
    let mut entries = Vec::with_capacity(items.len());
    let mut skipped = Vec::new();
    let mut seen = HashSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let entry: Entry = match serde_path_to_error::deserialize(item.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping entry #{} in {}: {}", index, origin.display(), e);
                skipped.push((index, item));
                continue;
            }
        };
        if entry.id.is_empty() {
            warn!(
                "Skipping entry #{} in {}: entry for '{}' has an empty id",
                index,
                origin.display(),
                entry.name
            );
            skipped.push((index, item));
            continue;
        }
        if !seen.insert(entry.id.clone()) {
            warn!(
                "Skipping entry #{} in {}: duplicate entry id '{}'",
                index,
                origin.display(),
                entry.id
            );
            skipped.push((index, item));
            continue;
        }
        entries.push(entry);
    }
    (entries, skipped)
}

/// Drop entries with an empty id or an id already seen, keeping the first.
pub fn dedupe_entries(entries: Vec<Entry>) -> Vec<Entry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| {
            if entry.id.is_empty() {
                warn!("Ignoring entry for '{}' with an empty id", entry.name);
                return false;
            }
            if !seen.insert(entry.id.clone()) {
                warn!("Ignoring duplicate entry id '{}'", entry.id);
                return false;
            }
            true
        })
        .collect()
}

impl ConfigStore for FileConfigStore {
    fn read(&self) -> Result<Vec<Entry>> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| LoaderError::ConfigRead {
            path: self.path.clone(),
            source,
        })?;
        let (entries, skipped) = split_entries(self.parse(&contents)?, &self.path);
        *self.skipped.lock() = skipped;
        Ok(entries)
    }

    /// Skipped items from the last read are written back at their original
    /// positions.
    fn write(&self, entries: &[Entry]) -> Result<()> {
        if !self.writable {
            return Err(LoaderError::ReadOnlyConfig(self.path.clone()));
        }
        let mut items = entries
            .iter()
            .map(serde_yaml::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| LoaderError::ConfigSerialize(e.to_string()))?;
        for (index, item) in self.skipped.lock().iter() {
            let at = (*index).min(items.len());
            items.insert(at, item.clone());
        }

        let contents = match self.format {
            ConfigFormat::Yaml => serde_yaml::to_string(&items)
                .map_err(|e| LoaderError::ConfigSerialize(e.to_string()))?,
            ConfigFormat::Json => {
                let mut s = serde_json::to_string_pretty(&items)
                    .map_err(|e| LoaderError::ConfigSerialize(e.to_string()))?;
                s.push('\n');
                s
            }
        };
        std::fs::write(&self.path, contents).map_err(|source| LoaderError::ConfigWrite {
            path: self.path.clone(),
            source,
        })
    }

    fn env(&self) -> HashMap<String, String> {
        merge_env_files(&self.initial_env, &self.base_dir)
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.path.clone()];
        paths.extend(ENV_FILES.iter().map(|f| self.base_dir.join(f)));
        paths
    }
}
