//! Reconciliation engine.
//!
//! Owns the map from entry id to live state and keeps the scope tree in line
//! with the declared entry list. Work happens in two phases: [`Loader::plan`]
//! evaluates gates, interpolates configs and resolves plugins without touching
//! any state (so resolution for different entries can overlap), then
//! [`Loader::commit`] applies the outcome. Commits run one at a time on the
//! engine's task, as does every scope notification.

mod handle;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use corral_protocol::protocol::EXIT_CODE_FULL_RELOAD;
use futures::future::join_all;
use serde_yaml::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use handle::{COMMAND_CHANNEL_CAPACITY, LoaderCommand, LoaderHandle};

use crate::config::{ConfigStore, Entry, dedupe_entries};
use crate::errors::{LoaderError, Result};
use crate::events::{
    LoaderEvent, LoaderEventMessage, LoaderEventReceiver, LoaderEventSender, loader_event_channel,
};
use crate::interpolate::Interpolator;
use crate::lua_eval::EvalContext;
use crate::plugin::{Plugin, Resolver};
use crate::scope::{ScopeEvent, ScopeHost, ScopeId};

/// Root service names.
pub const SERVICE_LOADER: &str = "loader";
pub const SERVICE_BASE_DIR: &str = "baseDir";

/// Capacity of the config-change channel fed by the watcher.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// How the engine leaves the process for a full reload.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Hand the shared state to the supervisor and exit with `code`.
    async fn full_reload(&self, code: i32);
}

/// Per-entry state.
struct EntryState {
    entry: Entry,
    instance: Option<ScopeId>,
    plugin: Option<Arc<dyn Plugin>>,
    /// Interpolated config last handed to `instance`
    resolved: Option<Value>,
    /// Set while the engine pushes a config into `instance` so the echoed
    /// `BeforeUpdate` is not written back.
    pending_self_update: bool,
}

impl EntryState {
    fn inactive(entry: Entry) -> Self {
        Self {
            entry,
            instance: None,
            plugin: None,
            resolved: None,
            pending_self_update: false,
        }
    }
}

/// Outcome of the read-only half of a reload.
pub enum Plan {
    /// Live, gate now false
    Deactivate,
    /// Live, push this interpolated config
    Update(Value),
    /// Not live, gate false
    Inactive,
    /// Not live, resolved and ready to instantiate
    Instantiate {
        plugin: Arc<dyn Plugin>,
        config: Value,
    },
    /// Not live, plugin could not be resolved
    Unresolved(LoaderError),
    /// Gate or config failed to evaluate
    Failed(LoaderError),
}

enum Step {
    Scope(ScopeEvent),
    Command(LoaderCommand),
    ConfigChanged,
    /// Explicit re-read, never suppressed
    Reload,
}

pub struct LoaderOptions {
    pub store: Arc<dyn ConfigStore>,
    pub host: Arc<dyn ScopeHost>,
    pub scope_events: mpsc::UnboundedReceiver<ScopeEvent>,
    pub resolver: Arc<dyn Resolver>,
    pub control: Arc<dyn ProcessControl>,
    /// Extra worker arguments, exposed to expressions as `argv`
    pub argv: Vec<String>,
}

pub struct Loader {
    store: Arc<dyn ConfigStore>,
    host: Arc<dyn ScopeHost>,
    resolver: Arc<dyn Resolver>,
    control: Arc<dyn ProcessControl>,
    interpolator: Interpolator,
    params: EvalContext,
    /// Declared list, in file order
    entries: Vec<Entry>,
    states: HashMap<String, EntryState>,
    scope_events: mpsc::UnboundedReceiver<ScopeEvent>,
    commands_tx: mpsc::Sender<LoaderCommand>,
    commands_rx: mpsc::Receiver<LoaderCommand>,
    changes_tx: mpsc::Sender<()>,
    changes_rx: mpsc::Receiver<()>,
    events: LoaderEventSender,
    /// Skip the next config change notification (our own write)
    suspend: bool,
    full_reload: Option<i32>,
}

impl Loader {
    pub fn new(options: LoaderOptions) -> Result<Self> {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let (events, _) = loader_event_channel();
        Ok(Self {
            store: options.store,
            host: options.host,
            resolver: options.resolver,
            control: options.control,
            interpolator: Interpolator::new()?,
            params: EvalContext {
                env: HashMap::new(),
                argv: options.argv,
            },
            entries: Vec::new(),
            states: HashMap::new(),
            scope_events: options.scope_events,
            commands_tx,
            commands_rx,
            changes_tx,
            changes_rx,
            events,
            suspend: false,
            full_reload: None,
        })
    }

    pub fn handle(&self) -> LoaderHandle {
        LoaderHandle::new(self.commands_tx.clone())
    }

    pub fn subscribe(&self) -> LoaderEventReceiver {
        self.events.subscribe()
    }

    /// Sender the config watcher notifies on file changes.
    pub fn change_sender(&self) -> mpsc::Sender<()> {
        self.changes_tx.clone()
    }

    pub fn host(&self) -> &Arc<dyn ScopeHost> {
        &self.host
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Declared entry list.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Live instance backing an entry.
    pub fn instance(&self, id: &str) -> Option<ScopeId> {
        self.states.get(id).and_then(|s| s.instance)
    }

    /// Whether reconciliation has considered this entry.
    pub fn has_state(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    pub fn is_pending_self_update(&self, id: &str) -> bool {
        self.states.get(id).is_some_and(|s| s.pending_self_update)
    }

    /// Full reload requested but not yet carried out.
    pub fn pending_full_reload(&self) -> Option<i32> {
        self.full_reload
    }

    fn emit(&self, event: LoaderEvent) {
        match &event {
            LoaderEvent::Apply { id, name } => info!("apply {} ({})", id, name),
            LoaderEvent::Unload { id, name } => info!("unload {} ({})", id, name),
            LoaderEvent::Reload { id, name } => info!("reload {} ({})", id, name),
            LoaderEvent::ConfigWritten => debug!("config written"),
            LoaderEvent::Ready => info!("loader ready"),
            LoaderEvent::FullReload { code } => info!("trigger full reload (code {})", code),
        }
        // No subscribers is fine
        let _ = self.events.send(LoaderEventMessage::new(event));
    }

    /// Re-read env files into the expression namespace.
    fn refresh_params(&mut self) {
        self.params.env = self.store.env();
    }

    /// One-time boot: register services, reconcile the declared list, then
    /// start the host once every resolution has settled.
    pub async fn start(&mut self) -> Result<()> {
        self.host.provide(SERVICE_LOADER, Arc::new(self.handle()));
        self.host
            .provide(SERVICE_BASE_DIR, Arc::new(self.store.base_dir().to_path_buf()));

        self.refresh_params();
        let entries = self.store.read()?;
        self.reconcile(entries).await?;

        self.host.start();
        self.process_scope_events();
        Ok(())
    }

    /// Reconcile against the declared list in `entries`.
    ///
    /// Ids that disappeared are unloaded and forgotten. An entry is skipped
    /// when its declaration is unchanged and evaluating it again gives the
    /// same activation and config. Everything else goes through a reload;
    /// resolutions overlap, commits do not. Entries with an empty or
    /// repeated id are logged and ignored.
    pub async fn reconcile(&mut self, entries: Vec<Entry>) -> Result<()> {
        let entries = dedupe_entries(entries);

        let keep: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let removed: Vec<Entry> = self
            .states
            .values()
            .filter(|s| !keep.contains(s.entry.id.as_str()))
            .map(|s| s.entry.clone())
            .collect();
        for entry in &removed {
            self.unload(entry);
            self.states.remove(&entry.id);
        }

        self.entries = entries;
        let todo: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| self.needs_reload(e))
            .cloned()
            .collect();

        let root = self.host.root();
        let plans = join_all(todo.iter().map(|entry| self.plan(entry))).await;
        for (entry, plan) in todo.iter().zip(plans) {
            self.commit(root, entry, plan);
        }
        Ok(())
    }

    fn needs_reload(&self, entry: &Entry) -> bool {
        let Some(state) = self.states.get(&entry.id) else {
            return true;
        };
        if state.entry != *entry {
            return true;
        }
        let active = match self
            .interpolator
            .is_truthy_like(entry.when.as_ref(), &self.params)
        {
            Ok(active) => active,
            Err(_) => return true,
        };
        if active != state.instance.is_some() {
            return true;
        }
        if state.instance.is_none() {
            return false;
        }
        // Env files can change the interpolated config of an unchanged declaration
        match self.interpolator.interpolate(&entry.config, &self.params) {
            Ok(config) => state.resolved.as_ref() != Some(&config),
            Err(_) => true,
        }
    }

    /// Re-read the store and reconcile. Errors are logged; the current
    /// state is left untouched when the config cannot be read.
    pub async fn reload_from_store(&mut self) {
        self.refresh_params();
        let entries = match self.store.read() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to read config: {}", e);
                return;
            }
        };
        if let Err(e) = self.reconcile(entries).await {
            error!("Failed to reconcile config: {}", e);
        }
    }

    /// React to a change notification from the config watcher. The first
    /// notification after our own write is swallowed.
    pub async fn on_config_changed(&mut self) {
        if std::mem::take(&mut self.suspend) {
            debug!("Ignoring change caused by our own config write");
            return;
        }
        self.reload_from_store().await;
    }

    /// Reload a single entry under `parent`: update it in place, start it,
    /// or stop it depending on its gate. Returns the live instance.
    pub async fn reload(&mut self, parent: ScopeId, entry: &Entry) -> Option<ScopeId> {
        let plan = self.plan(entry).await;
        self.commit(parent, entry, plan)
    }

    /// Read-only half of a reload. Suspends only while resolving a plugin.
    pub async fn plan(&self, entry: &Entry) -> Plan {
        let active = match self
            .interpolator
            .is_truthy_like(entry.when.as_ref(), &self.params)
        {
            Ok(active) => active,
            Err(e) => return Plan::Failed(e),
        };
        let live = self.instance(&entry.id).is_some();

        match (live, active) {
            (true, false) => Plan::Deactivate,
            (false, false) => Plan::Inactive,
            (true, true) => match self.interpolator.interpolate(&entry.config, &self.params) {
                Ok(config) => Plan::Update(config),
                Err(e) => Plan::Failed(e),
            },
            (false, true) => {
                let config = match self.interpolator.interpolate(&entry.config, &self.params) {
                    Ok(config) => config,
                    Err(e) => return Plan::Failed(e),
                };
                self.emit(LoaderEvent::Apply {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                });
                match self.resolver.resolve(&entry.name).await {
                    Ok(plugin) => Plan::Instantiate { plugin, config },
                    Err(e) => Plan::Unresolved(e),
                }
            }
        }
    }

    /// Apply a plan. Failures are logged and confined to `entry`.
    pub fn commit(&mut self, parent: ScopeId, entry: &Entry, plan: Plan) -> Option<ScopeId> {
        match plan {
            Plan::Deactivate => {
                self.unload(entry);
                self.record_inactive(entry);
                None
            }
            Plan::Inactive => {
                debug!("{} is inactive", entry.id);
                self.record_inactive(entry);
                None
            }
            Plan::Update(config) => self.push_update(entry, config),
            Plan::Instantiate { plugin, config } => self.instantiate(parent, entry, plugin, config),
            Plan::Unresolved(e) => {
                error!("Failed to resolve {} for {}: {}", entry.name, entry.id, e);
                self.record_inactive(entry);
                None
            }
            Plan::Failed(e) => {
                error!("Failed to load {}: {}", entry.id, e);
                let instance = self.instance(&entry.id);
                if instance.is_none() {
                    self.record_inactive(entry);
                }
                instance
            }
        }
    }

    fn record_inactive(&mut self, entry: &Entry) {
        match self.states.get_mut(&entry.id) {
            Some(state) if state.instance.is_none() => {
                state.entry = entry.clone();
                state.plugin = None;
            }
            Some(_) => {}
            None => {
                self.states
                    .insert(entry.id.clone(), EntryState::inactive(entry.clone()));
            }
        }
    }

    fn push_update(&mut self, entry: &Entry, config: Value) -> Option<ScopeId> {
        // Foreign notifications queued so far must not consume the marker
        self.process_scope_events();

        let state = self.states.get_mut(&entry.id)?;
        let Some(instance) = state.instance else {
            return None;
        };
        state.entry = entry.clone();
        state.resolved = Some(config.clone());
        state.pending_self_update = true;

        let result = self.host.update(instance, config);
        self.process_scope_events();

        // One-shot: never survives the step that set it
        if let Some(state) = self.states.get_mut(&entry.id) {
            state.pending_self_update = false;
        }

        if let Err(e) = result {
            error!("Failed to update {}: {}", entry.id, e);
        }
        Some(instance)
    }

    fn instantiate(
        &mut self,
        parent: ScopeId,
        entry: &Entry,
        plugin: Arc<dyn Plugin>,
        config: Value,
    ) -> Option<ScopeId> {
        let context = match self.host.extend(parent) {
            Ok(context) => context,
            Err(e) => {
                error!("Failed to create scope for {}: {}", entry.id, e);
                self.record_inactive(entry);
                return None;
            }
        };

        let instance = match self
            .host
            .instantiate(context, &entry.name, plugin.clone(), config.clone())
        {
            Ok(instance) => instance,
            Err(e) => {
                error!("Failed to apply {}: {}", entry.id, e);
                self.host.dispose(context);
                self.record_inactive(entry);
                return None;
            }
        };

        if let Err(e) = self.host.tag(instance, &entry.id) {
            warn!("Failed to tag {} with {}: {}", instance, entry.id, e);
        }
        self.states.insert(
            entry.id.clone(),
            EntryState {
                entry: entry.clone(),
                instance: Some(instance),
                plugin: Some(plugin),
                resolved: Some(config),
                pending_self_update: false,
            },
        );
        Some(instance)
    }

    /// Stop the live instance backing `entry`, if any.
    pub fn unload(&mut self, entry: &Entry) {
        let Some(state) = self.states.get_mut(&entry.id) else {
            return;
        };
        let Some(instance) = state.instance.take() else {
            return;
        };
        state.plugin = None;
        state.resolved = None;
        state.pending_self_update = false;
        let name = state.entry.name.clone();

        self.emit(LoaderEvent::Unload {
            id: entry.id.clone(),
            name,
        });
        self.host.dispose(instance);
        self.process_scope_events();
    }

    /// Unload every live entry. The root scope stays up, so this never
    /// triggers a full reload.
    pub fn shutdown(&mut self) {
        let live: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| self.instance(&e.id).is_some())
            .cloned()
            .collect();
        for entry in live.iter().rev() {
            self.unload(entry);
        }
        // Live states whose entry left the declared list
        let stray: Vec<Entry> = self
            .states
            .values()
            .filter(|s| s.instance.is_some())
            .map(|s| s.entry.clone())
            .collect();
        for entry in &stray {
            self.unload(entry);
        }
    }

    /// Persist the declared list. Our own write is hidden from the watcher
    /// once.
    pub fn write_config(&mut self, silent: bool) -> Result<()> {
        self.suspend = true;
        if let Err(e) = self.store.write(&self.entries) {
            self.suspend = false;
            return Err(e);
        }
        if !silent {
            self.emit(LoaderEvent::ConfigWritten);
        }
        Ok(())
    }

    /// Ask for a full reload; carried out by [`Loader::run`].
    pub fn request_full_reload(&mut self, code: i32) {
        self.full_reload.get_or_insert(code);
    }

    /// Handle every scope notification that is already queued.
    pub fn process_scope_events(&mut self) {
        while let Ok(event) = self.scope_events.try_recv() {
            self.handle_scope_event(event);
        }
    }

    fn entry_for_instance(&self, instance: ScopeId) -> Option<String> {
        self.states
            .values()
            .find(|s| s.instance == Some(instance))
            .map(|s| s.entry.id.clone())
    }

    fn handle_scope_event(&mut self, event: ScopeEvent) {
        match event {
            ScopeEvent::BeforeUpdate { instance, config } => self.on_before_update(instance, config),
            ScopeEvent::Updated { instance } => {
                if let Some(state) = self.states.values().find(|s| s.instance == Some(instance)) {
                    self.emit(LoaderEvent::Reload {
                        id: state.entry.id.clone(),
                        name: state.entry.name.clone(),
                    });
                }
            }
            ScopeEvent::Disposed { scope } => {
                if scope == self.host.root() {
                    self.request_full_reload(EXIT_CODE_FULL_RELOAD);
                } else if let Some(state) =
                    self.states.values_mut().find(|s| s.instance == Some(scope))
                {
                    debug!("{} was disposed externally", state.entry.id);
                    state.instance = None;
                    state.plugin = None;
                    state.resolved = None;
                    state.pending_self_update = false;
                }
            }
            ScopeEvent::Ready => self.emit(LoaderEvent::Ready),
        }
    }

    fn on_before_update(&mut self, instance: ScopeId, config: Value) {
        let Some(id) = self.entry_for_instance(instance) else {
            return;
        };
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        if state.pending_self_update {
            state.pending_self_update = false;
            return;
        }

        // Edit from inside the instance: persist it
        let config = match &state.plugin {
            Some(plugin) => plugin.simplify(config),
            None => config,
        };
        state.entry.config = config.clone();
        state.resolved = Some(config.clone());
        if let Some(declared) = self.entries.iter_mut().find(|e| e.id == id) {
            declared.config = config;
        }
        if let Err(e) = self.write_config(false) {
            error!("Failed to persist config of {}: {}", id, e);
        }
    }

    fn handle_command(&mut self, cmd: LoaderCommand) -> Option<Step> {
        match cmd {
            LoaderCommand::FullReload { code } => self.request_full_reload(code),
            LoaderCommand::Reload => return Some(Step::Reload),
            LoaderCommand::Paths { scope, reply } => {
                let _ = reply.send(self.host.paths(scope));
            }
            LoaderCommand::Entries { reply } => {
                let _ = reply.send(self.entries.clone());
            }
        }
        None
    }

    /// Serve notifications, commands and config changes until a full reload
    /// is requested; returns its exit code after the process control has
    /// been told.
    pub async fn run(&mut self) -> i32 {
        loop {
            if let Some(code) = self.full_reload.take() {
                self.emit(LoaderEvent::FullReload { code });
                self.control.full_reload(code).await;
                return code;
            }

            let step = tokio::select! {
                Some(event) = self.scope_events.recv() => Step::Scope(event),
                Some(cmd) = self.commands_rx.recv() => Step::Command(cmd),
                Some(()) = self.changes_rx.recv() => Step::ConfigChanged,
            };

            let step = match step {
                Step::Command(cmd) => self.handle_command(cmd),
                other => Some(other),
            };
            match step {
                Some(Step::Scope(event)) => {
                    self.handle_scope_event(event);
                    self.process_scope_events();
                }
                Some(Step::ConfigChanged) => self.on_config_changed().await,
                Some(Step::Reload) => self.reload_from_store().await,
                Some(Step::Command(_)) | None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests;
