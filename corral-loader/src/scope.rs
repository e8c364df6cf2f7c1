//! Hierarchical scope tree hosting live plugin instances.
//!
//! Nodes live in an arena keyed by [`ScopeId`]. Ids are handed out from a
//! counter and never reused, so a stale id simply stops resolving once its
//! node is gone.
//!
//! Layout:
//! - the root, which is its own parent;
//! - contexts, created by [`ScopeHost::extend`];
//! - one runtime per plugin name, a child of the root that aggregates every
//!   live instance of that plugin;
//! - forks, the live instances, parented to the context they were created in.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_yaml::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::addressing::{self, ScopeGraph};
use crate::errors::{LoaderError, Result};
use crate::plugin::Plugin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type-erased service stored on the root scope.
pub type Service = Arc<dyn Any + Send + Sync>;

/// Notifications emitted by a scope host.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeEvent {
    /// An instance is about to receive `config`
    BeforeUpdate { instance: ScopeId, config: Value },
    /// An instance finished applying a new config
    Updated { instance: ScopeId },
    /// An instance (or the root) was torn down
    Disposed { scope: ScopeId },
    /// The host began normal operation
    Ready,
}

/// Interface the reconciliation engine drives.
pub trait ScopeHost: Send + Sync {
    fn root(&self) -> ScopeId;

    /// Create a child context under `parent`.
    fn extend(&self, parent: ScopeId) -> Result<ScopeId>;

    /// Create a live instance of `plugin` inside `context`.
    fn instantiate(
        &self,
        context: ScopeId,
        name: &str,
        plugin: Arc<dyn Plugin>,
        config: Value,
    ) -> Result<ScopeId>;

    /// Attach a stable entry id to a scope.
    fn tag(&self, scope: ScopeId, id: &str) -> Result<()>;

    /// Push a new config into a live instance.
    fn update(&self, instance: ScopeId, config: Value) -> Result<()>;

    /// Tear down a scope and everything below it. Unknown ids are ignored.
    fn dispose(&self, scope: ScopeId);

    fn contains(&self, scope: ScopeId) -> bool;

    /// Current config of a live instance.
    fn config(&self, instance: ScopeId) -> Option<Value>;

    /// Entry ids rooted at `scope`.
    fn paths(&self, scope: ScopeId) -> Vec<String>;

    fn provide(&self, name: &str, service: Service);

    fn inject(&self, name: &str) -> Option<Service>;

    /// Begin normal operation.
    fn start(&self);
}

/// Handle given to plugin callbacks for the instance being driven.
#[derive(Clone)]
pub struct InstanceContext {
    id: ScopeId,
    host: Weak<dyn ScopeHost>,
}

impl InstanceContext {
    pub fn new(id: ScopeId, host: Weak<dyn ScopeHost>) -> Self {
        Self { id, host }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// The hosting tree, unless it has already been dropped.
    pub fn host(&self) -> Option<Arc<dyn ScopeHost>> {
        self.host.upgrade()
    }

    /// Change this instance's config from inside the instance. The engine
    /// persists such edits back to the config file.
    pub fn update(&self, config: Value) -> Result<()> {
        match self.host() {
            Some(host) => host.update(self.id, config),
            None => Err(LoaderError::UnknownScope(self.id)),
        }
    }

    pub fn dispose(&self) {
        if let Some(host) = self.host() {
            host.dispose(self.id);
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.host().map(|h| h.paths(self.id)).unwrap_or_default()
    }

    /// Look up a root service by name and concrete type.
    pub fn inject<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.host()?.inject(name)?.downcast::<T>().ok()
    }
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext").field("id", &self.id).finish()
    }
}

enum NodeKind {
    Root,
    Context,
    Runtime {
        forks: Vec<ScopeId>,
    },
    Fork {
        name: String,
        plugin: Arc<dyn Plugin>,
        config: Value,
    },
}

struct Node {
    parent: ScopeId,
    children: Vec<ScopeId>,
    tag: Option<String>,
    kind: NodeKind,
}

impl Node {
    fn new(parent: ScopeId, kind: NodeKind) -> Self {
        Self {
            parent,
            children: Vec::new(),
            tag: None,
            kind,
        }
    }
}

struct Arena {
    nodes: HashMap<ScopeId, Node>,
    runtimes: HashMap<String, ScopeId>,
    root: ScopeId,
    next_id: u64,
    closed: bool,
}

impl Arena {
    fn new() -> Self {
        let root = ScopeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(root, Node::new(root, NodeKind::Root));
        Self {
            nodes,
            runtimes: HashMap::new(),
            root,
            next_id: 1,
            closed: false,
        }
    }

    fn alloc(&mut self, node: Node) -> ScopeId {
        let id = ScopeId(self.next_id);
        self.next_id += 1;
        let parent = node.parent;
        self.nodes.insert(id, node);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    fn runtime_for(&mut self, name: &str) -> ScopeId {
        if let Some(id) = self.runtimes.get(name) {
            return *id;
        }
        let id = self.alloc(Node::new(self.root, NodeKind::Runtime { forks: Vec::new() }));
        self.runtimes.insert(name.to_string(), id);
        id
    }

    fn detach(&mut self, id: ScopeId, parent: ScopeId) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != id);
        }
    }

    /// Drop a fork from its plugin's runtime, removing the runtime once empty.
    fn unregister_fork(&mut self, fork: ScopeId, name: &str) {
        let Some(runtime) = self.runtimes.get(name).copied() else {
            return;
        };
        let empty = match self.nodes.get_mut(&runtime) {
            Some(Node {
                kind: NodeKind::Runtime { forks },
                ..
            }) => {
                forks.retain(|f| *f != fork);
                forks.is_empty()
            }
            _ => false,
        };
        if empty {
            self.nodes.remove(&runtime);
            self.runtimes.remove(name);
            let root = self.root;
            self.detach(runtime, root);
        }
    }

    /// Remove `target` and its structural subtree, collecting disposed forks
    /// deepest first.
    fn remove_subtree(&mut self, target: ScopeId, removed: &mut Vec<(ScopeId, Arc<dyn Plugin>)>) {
        let Some(parent) = self.nodes.get(&target).map(|n| n.parent) else {
            return;
        };

        let mut order = Vec::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                order.push(id);
                stack.extend(node.children.iter().copied());
            }
        }

        for id in order.into_iter().rev() {
            let Some(node) = self.nodes.remove(&id) else {
                continue;
            };
            match node.kind {
                NodeKind::Fork { name, plugin, .. } => {
                    self.unregister_fork(id, &name);
                    removed.push((id, plugin));
                }
                NodeKind::Runtime { .. } => {
                    self.runtimes.retain(|_, r| *r != id);
                }
                NodeKind::Root | NodeKind::Context => {}
            }
        }

        if parent != target {
            self.detach(target, parent);
            // A context only exists to hold instances
            let orphaned = matches!(
                self.nodes.get(&parent),
                Some(Node { kind: NodeKind::Context, children, .. }) if children.is_empty()
            );
            if orphaned {
                self.remove_subtree(parent, removed);
            }
        }
    }
}

impl ScopeGraph for Arena {
    fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.nodes.get(&scope).map(|n| n.parent)
    }

    fn tag(&self, scope: ScopeId) -> Option<&str> {
        self.nodes.get(&scope).and_then(|n| n.tag.as_deref())
    }

    fn aggregated(&self, scope: ScopeId) -> Option<&[ScopeId]> {
        match self.nodes.get(&scope) {
            Some(Node {
                kind: NodeKind::Runtime { forks },
                ..
            }) => Some(forks.as_slice()),
            _ => None,
        }
    }
}

/// Default in-process scope host.
pub struct ScopeTree {
    this: Weak<ScopeTree>,
    arena: Mutex<Arena>,
    services: Mutex<HashMap<String, Service>>,
    events: mpsc::UnboundedSender<ScopeEvent>,
}

impl ScopeTree {
    /// Create a tree and the receiver its notifications are delivered to.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ScopeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let tree = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            arena: Mutex::new(Arena::new()),
            services: Mutex::new(HashMap::new()),
            events,
        });
        (tree, rx)
    }

    fn context_for(&self, id: ScopeId) -> InstanceContext {
        let host: Weak<dyn ScopeHost> = self.this.clone();
        InstanceContext::new(id, host)
    }

    fn emit(&self, event: ScopeEvent) {
        // The receiver going away only means nobody is listening any more
        let _ = self.events.send(event);
    }

    /// Runtime (aggregation node) for a plugin name, if any instance is live.
    pub fn runtime(&self, name: &str) -> Option<ScopeId> {
        self.arena.lock().runtimes.get(name).copied()
    }

    /// Live instances, oldest first.
    pub fn instances(&self) -> Vec<ScopeId> {
        let arena = self.arena.lock();
        let mut ids: Vec<ScopeId> = arena
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Fork { .. }))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.arena.lock().closed
    }
}

impl ScopeHost for ScopeTree {
    fn root(&self) -> ScopeId {
        self.arena.lock().root
    }

    fn extend(&self, parent: ScopeId) -> Result<ScopeId> {
        let mut arena = self.arena.lock();
        match arena.nodes.get(&parent) {
            Some(Node {
                kind: NodeKind::Runtime { .. },
                ..
            })
            | None => return Err(LoaderError::UnknownScope(parent)),
            Some(_) if arena.closed => return Err(LoaderError::UnknownScope(parent)),
            Some(_) => {}
        }
        Ok(arena.alloc(Node::new(parent, NodeKind::Context)))
    }

    fn instantiate(
        &self,
        context: ScopeId,
        name: &str,
        plugin: Arc<dyn Plugin>,
        config: Value,
    ) -> Result<ScopeId> {
        let fork = {
            let mut arena = self.arena.lock();
            if arena.closed || !arena.nodes.contains_key(&context) {
                return Err(LoaderError::UnknownScope(context));
            }
            let runtime = arena.runtime_for(name);
            let fork = arena.alloc(Node::new(
                context,
                NodeKind::Fork {
                    name: name.to_string(),
                    plugin: plugin.clone(),
                    config: config.clone(),
                },
            ));
            if let Some(Node {
                kind: NodeKind::Runtime { forks },
                ..
            }) = arena.nodes.get_mut(&runtime)
            {
                forks.push(fork);
            }
            fork
        };

        if let Err(source) = plugin.apply(&self.context_for(fork), &config) {
            // Never came up, so it is removed without a dispose callback
            let mut removed = Vec::new();
            self.arena.lock().remove_subtree(fork, &mut removed);
            return Err(LoaderError::Plugin {
                name: name.to_string(),
                source,
            });
        }

        debug!("Instantiated {} as {}", name, fork);
        Ok(fork)
    }

    fn tag(&self, scope: ScopeId, id: &str) -> Result<()> {
        let mut arena = self.arena.lock();
        let node = arena
            .nodes
            .get_mut(&scope)
            .ok_or(LoaderError::UnknownScope(scope))?;
        node.tag = Some(id.to_string());
        Ok(())
    }

    fn update(&self, instance: ScopeId, config: Value) -> Result<()> {
        let (name, plugin) = match self.arena.lock().nodes.get(&instance) {
            Some(Node {
                kind: NodeKind::Fork { name, plugin, .. },
                ..
            }) => (name.clone(), plugin.clone()),
            _ => return Err(LoaderError::UnknownScope(instance)),
        };

        self.emit(ScopeEvent::BeforeUpdate {
            instance,
            config: config.clone(),
        });

        plugin
            .reconfigure(&self.context_for(instance), &config)
            .map_err(|source| LoaderError::Plugin { name, source })?;

        if let Some(Node {
            kind: NodeKind::Fork { config: current, .. },
            ..
        }) = self.arena.lock().nodes.get_mut(&instance)
        {
            *current = config;
        }

        self.emit(ScopeEvent::Updated { instance });
        Ok(())
    }

    fn dispose(&self, scope: ScopeId) {
        let mut removed = Vec::new();
        let root_disposed = {
            let mut arena = self.arena.lock();
            let Some(node) = arena.nodes.get(&scope) else {
                return;
            };
            match &node.kind {
                NodeKind::Root => {
                    if arena.closed {
                        return;
                    }
                    let children = node.children.clone();
                    for child in children {
                        arena.remove_subtree(child, &mut removed);
                    }
                    arena.closed = true;
                    true
                }
                NodeKind::Runtime { forks } => {
                    for fork in forks.clone() {
                        arena.remove_subtree(fork, &mut removed);
                    }
                    false
                }
                NodeKind::Context | NodeKind::Fork { .. } => {
                    arena.remove_subtree(scope, &mut removed);
                    false
                }
            }
        };

        for (id, plugin) in removed {
            plugin.dispose(&self.context_for(id));
            debug!("Disposed {}", id);
            self.emit(ScopeEvent::Disposed { scope: id });
        }
        if root_disposed {
            self.emit(ScopeEvent::Disposed { scope });
        }
    }

    fn contains(&self, scope: ScopeId) -> bool {
        self.arena.lock().nodes.contains_key(&scope)
    }

    fn config(&self, instance: ScopeId) -> Option<Value> {
        match self.arena.lock().nodes.get(&instance) {
            Some(Node {
                kind: NodeKind::Fork { config, .. },
                ..
            }) => Some(config.clone()),
            _ => None,
        }
    }

    fn paths(&self, scope: ScopeId) -> Vec<String> {
        addressing::paths(&*self.arena.lock(), scope)
    }

    fn provide(&self, name: &str, service: Service) {
        self.services.lock().insert(name.to_string(), service);
    }

    fn inject(&self, name: &str) -> Option<Service> {
        self.services.lock().get(name).cloned()
    }

    fn start(&self) {
        self.emit(ScopeEvent::Ready);
    }
}
