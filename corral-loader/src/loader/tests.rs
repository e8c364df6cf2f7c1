use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::*;
use crate::plugin::PluginRegistry;
use crate::scope::{InstanceContext, ScopeTree};

#[derive(Default)]
struct MemoryStore {
    entries: Mutex<Vec<Entry>>,
    writes: Mutex<Vec<Vec<Entry>>>,
    env: Mutex<HashMap<String, String>>,
    read_only: bool,
}

impl MemoryStore {
    fn with(entries: Vec<Entry>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(entries),
            ..Default::default()
        })
    }

    fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

impl ConfigStore for MemoryStore {
    fn read(&self) -> Result<Vec<Entry>> {
        Ok(self.entries.lock().clone())
    }

    fn write(&self, entries: &[Entry]) -> Result<()> {
        if self.read_only {
            return Err(LoaderError::ReadOnlyConfig(PathBuf::from("corral.yml")));
        }
        self.writes.lock().push(entries.to_vec());
        *self.entries.lock() = entries.to_vec();
        Ok(())
    }

    fn env(&self) -> HashMap<String, String> {
        self.env.lock().clone()
    }

    fn base_dir(&self) -> &Path {
        Path::new("/srv/app")
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("/srv/app/corral.yml")]
    }
}

#[derive(Default)]
struct Recorder {
    applied: Mutex<Vec<Value>>,
    reconfigured: Mutex<Vec<Value>>,
    disposed: AtomicUsize,
    fail_apply: bool,
}

impl Plugin for Recorder {
    fn apply(&self, _ctx: &InstanceContext, config: &Value) -> anyhow::Result<()> {
        if self.fail_apply {
            anyhow::bail!("port already in use");
        }
        self.applied.lock().push(config.clone());
        Ok(())
    }

    fn reconfigure(&self, _ctx: &InstanceContext, config: &Value) -> anyhow::Result<()> {
        self.reconfigured.lock().push(config.clone());
        Ok(())
    }

    fn dispose(&self, _ctx: &InstanceContext) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn simplify(&self, config: Value) -> Value {
        // Drop null fields
        match config {
            Value::Mapping(map) => Value::Mapping(
                map.into_iter()
                    .filter(|(_, v)| !v.is_null())
                    .collect(),
            ),
            other => other,
        }
    }
}

#[derive(Default)]
struct RecordingControl {
    codes: Mutex<Vec<i32>>,
}

#[async_trait]
impl ProcessControl for RecordingControl {
    async fn full_reload(&self, code: i32) {
        self.codes.lock().push(code);
    }
}

struct Harness {
    loader: Loader,
    tree: Arc<ScopeTree>,
    store: Arc<MemoryStore>,
    registry: Arc<PluginRegistry>,
    control: Arc<RecordingControl>,
}

fn harness(store: Arc<MemoryStore>) -> Harness {
    let (tree, scope_events) = ScopeTree::new();
    let registry = Arc::new(PluginRegistry::new());
    let control = Arc::new(RecordingControl::default());
    let loader = Loader::new(LoaderOptions {
        store: store.clone(),
        host: tree.clone(),
        scope_events,
        resolver: registry.clone(),
        control: control.clone(),
        argv: vec!["--port".to_string(), "8080".to_string()],
    })
    .unwrap();
    Harness {
        loader,
        tree,
        store,
        registry,
        control,
    }
}

fn yaml(s: &str) -> Value {
    serde_yaml::from_str(s).unwrap()
}

fn drain_events(rx: &mut LoaderEventReceiver) -> Vec<LoaderEvent> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg.event);
    }
    out
}

#[tokio::test]
async fn start_instantiates_active_entries_and_tags_them() {
    let store = MemoryStore::with(vec![
        Entry::new("web", "http").with_config(yaml("port: 80")),
        Entry::new("db", "sql"),
    ]);
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    let sql = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.registry.register("sql", sql.clone());
    let mut events = h.loader.subscribe();

    h.loader.start().await.unwrap();

    let web = h.loader.instance("web").unwrap();
    let db = h.loader.instance("db").unwrap();
    assert_eq!(h.tree.paths(web), vec!["web".to_string()]);
    assert_eq!(h.tree.paths(db), vec!["db".to_string()]);
    assert_eq!(http.applied.lock().as_slice(), &[yaml("port: 80")]);
    assert_eq!(sql.applied.lock().len(), 1);

    let events = drain_events(&mut events);
    assert!(events.contains(&LoaderEvent::Apply {
        id: "web".into(),
        name: "http".into()
    }));
    assert_eq!(events.last(), Some(&LoaderEvent::Ready));
}

#[tokio::test]
async fn start_registers_root_services() {
    let mut h = harness(MemoryStore::with(vec![]));
    h.loader.start().await.unwrap();

    let base = h.tree.inject(SERVICE_BASE_DIR).unwrap();
    let base = base.downcast::<PathBuf>().unwrap();
    assert_eq!(*base, PathBuf::from("/srv/app"));
    let handle = h.tree.inject(SERVICE_LOADER).unwrap();
    assert!(handle.downcast::<LoaderHandle>().is_ok());
}

#[tokio::test]
async fn false_gate_keeps_entry_inactive() {
    let store = MemoryStore::with(vec![
        Entry::new("web", "http").with_when(Value::Bool(false)),
        Entry::new("dev", "http").with_when(Value::String("env.MODE == 'dev'".into())),
    ]);
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());

    h.loader.start().await.unwrap();

    assert!(h.loader.instance("web").is_none());
    assert!(h.loader.instance("dev").is_none());
    assert!(h.loader.has_state("web"));
    assert!(http.applied.lock().is_empty());
    assert!(h.tree.instances().is_empty());
}

#[tokio::test]
async fn gate_reads_env_files_and_argv() {
    let store = MemoryStore::with(vec![
        Entry::new("dev", "http").with_when(Value::String("env.MODE == 'dev'".into())),
        Entry::new("port", "http")
            .with_config(yaml("port: ${{ tonumber(argv[2]) }}"))
            .with_when(Value::String("#argv == 2".into())),
    ]);
    store.env.lock().insert("MODE".into(), "dev".into());
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());

    h.loader.start().await.unwrap();

    assert!(h.loader.instance("dev").is_some());
    assert!(h.loader.instance("port").is_some());
    assert!(http.applied.lock().contains(&yaml("port: 8080")));
}

#[tokio::test]
async fn deactivation_disposes_exactly_once() {
    let store = MemoryStore::with(vec![Entry::new("web", "http")]);
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let mut events = h.loader.subscribe();

    let gated = vec![Entry::new("web", "http").with_when(Value::Bool(false))];
    h.loader.reconcile(gated.clone()).await.unwrap();
    h.loader.reconcile(gated).await.unwrap();

    assert_eq!(http.disposed.load(Ordering::SeqCst), 1);
    assert!(h.loader.instance("web").is_none());
    assert!(h.tree.instances().is_empty());
    let unloads = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, LoaderEvent::Unload { .. }))
        .count();
    assert_eq!(unloads, 1);
}

#[tokio::test]
async fn reactivation_creates_a_fresh_instance() {
    let store = MemoryStore::with(vec![Entry::new("web", "http")]);
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let first = h.loader.instance("web").unwrap();

    let off = Entry::new("web", "http").with_when(Value::Bool(false));
    h.loader.reconcile(vec![off]).await.unwrap();
    h.loader
        .reconcile(vec![Entry::new("web", "http")])
        .await
        .unwrap();

    let second = h.loader.instance("web").unwrap();
    assert_ne!(first, second);
    assert!(!h.tree.contains(first));
    assert_eq!(http.applied.lock().len(), 2);
}

#[tokio::test]
async fn reconcile_with_same_entries_is_a_no_op() {
    let entries = vec![Entry::new("web", "http").with_config(yaml("port: 80"))];
    let mut h = harness(MemoryStore::with(entries.clone()));
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let instance = h.loader.instance("web");

    h.loader.reconcile(entries.clone()).await.unwrap();
    h.loader.reconcile(entries).await.unwrap();

    assert_eq!(h.loader.instance("web"), instance);
    assert_eq!(http.applied.lock().len(), 1);
    assert!(http.reconfigured.lock().is_empty());
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn config_change_updates_in_place_without_writing_back() {
    let mut h = harness(MemoryStore::with(vec![
        Entry::new("web", "http").with_config(yaml("port: 80")),
    ]));
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let instance = h.loader.instance("web");
    let mut events = h.loader.subscribe();

    h.loader
        .reconcile(vec![Entry::new("web", "http").with_config(yaml("port: 81"))])
        .await
        .unwrap();

    assert_eq!(h.loader.instance("web"), instance);
    assert_eq!(http.reconfigured.lock().as_slice(), &[yaml("port: 81")]);
    assert_eq!(h.store.write_count(), 0);
    assert!(!h.loader.is_pending_self_update("web"));
    let events = drain_events(&mut events);
    assert!(events.contains(&LoaderEvent::Reload {
        id: "web".into(),
        name: "http".into()
    }));
    assert!(!events.contains(&LoaderEvent::ConfigWritten));
}

#[tokio::test]
async fn edit_from_inside_instance_is_simplified_and_persisted() {
    let mut h = harness(MemoryStore::with(vec![
        Entry::new("web", "http").with_config(yaml("port: 80")),
    ]));
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let instance = h.loader.instance("web").unwrap();
    let mut events = h.loader.subscribe();

    h.tree
        .update(instance, yaml("port: 90\nhost: null"))
        .unwrap();
    h.loader.process_scope_events();

    let writes = h.store.writes.lock().clone();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0][0].config, yaml("port: 90"));
    assert_eq!(h.loader.entries()[0].config, yaml("port: 90"));
    assert!(drain_events(&mut events).contains(&LoaderEvent::ConfigWritten));

    // The write is not echoed back as a change
    h.loader
        .reconcile(h.store.read().unwrap())
        .await
        .unwrap();
    assert_eq!(h.loader.instance("web"), Some(instance));
    assert_eq!(h.store.write_count(), 1);
}

#[tokio::test]
async fn write_error_is_logged_not_fatal() {
    let store = Arc::new(MemoryStore {
        entries: Mutex::new(vec![Entry::new("web", "http")]),
        read_only: true,
        ..Default::default()
    });
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let instance = h.loader.instance("web").unwrap();

    h.tree.update(instance, yaml("port: 1")).unwrap();
    h.loader.process_scope_events();

    assert!(matches!(
        h.loader.write_config(true),
        Err(LoaderError::ReadOnlyConfig(_))
    ));
    assert_eq!(h.loader.instance("web"), Some(instance));
}

#[tokio::test]
async fn unresolved_plugin_is_isolated() {
    let store = MemoryStore::with(vec![
        Entry::new("missing", "nope"),
        Entry::new("web", "http"),
    ]);
    let mut h = harness(store);
    h.registry.register("http", Arc::new(Recorder::default()));

    h.loader.start().await.unwrap();

    assert!(h.loader.instance("missing").is_none());
    assert!(h.loader.instance("web").is_some());
}

#[tokio::test]
async fn failing_apply_is_isolated() {
    let store = MemoryStore::with(vec![Entry::new("bad", "broken"), Entry::new("web", "http")]);
    let mut h = harness(store);
    h.registry.register(
        "broken",
        Arc::new(Recorder {
            fail_apply: true,
            ..Default::default()
        }),
    );
    h.registry.register("http", Arc::new(Recorder::default()));

    h.loader.start().await.unwrap();

    assert!(h.loader.instance("bad").is_none());
    assert!(h.loader.instance("web").is_some());
    assert_eq!(h.tree.instances().len(), 1);
}

#[tokio::test]
async fn malformed_expression_is_isolated() {
    let store = MemoryStore::with(vec![
        Entry::new("bad", "http").with_config(yaml("port: ${{ 1 + }}")),
        Entry::new("gate", "http").with_when(Value::String("((".into())),
        Entry::new("web", "http"),
    ]);
    let mut h = harness(store);
    h.registry.register("http", Arc::new(Recorder::default()));

    h.loader.start().await.unwrap();

    assert!(h.loader.instance("bad").is_none());
    assert!(h.loader.instance("gate").is_none());
    assert!(h.loader.instance("web").is_some());
}

#[tokio::test]
async fn reconcile_removes_vanished_entries() {
    let store = MemoryStore::with(vec![Entry::new("web", "http"), Entry::new("db", "http")]);
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let db = h.loader.instance("db").unwrap();

    h.loader
        .reconcile(vec![Entry::new("web", "http")])
        .await
        .unwrap();

    assert!(!h.loader.has_state("db"));
    assert!(!h.tree.contains(db));
    assert!(h.loader.instance("web").is_some());
    assert_eq!(http.disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconcile_keeps_first_of_duplicate_ids() {
    let mut h = harness(MemoryStore::with(vec![]));
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    h.loader
        .reconcile(vec![
            Entry::new("a", "http").with_config(yaml("port: 1")),
            Entry::new("a", "http").with_config(yaml("port: 2")),
            Entry::new("b", "http"),
        ])
        .await
        .unwrap();

    assert!(h.loader.instance("a").is_some());
    assert!(h.loader.instance("b").is_some());
    assert_eq!(h.tree.instances().len(), 2);
    assert_eq!(h.loader.entries().len(), 2);
    assert_eq!(http.applied.lock()[0], yaml("port: 1"));
}

#[tokio::test]
async fn env_change_pushes_interpolated_config() {
    let store = MemoryStore::with(vec![
        Entry::new("web", "http").with_config(yaml("port: ${{ tonumber(env.PORT) }}")),
    ]);
    store.env.lock().insert("PORT".into(), "80".into());
    let mut h = harness(store);
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();
    let instance = h.loader.instance("web");

    h.store.env.lock().insert("PORT".into(), "81".into());
    h.loader.reload_from_store().await;
    h.loader.reload_from_store().await;

    assert_eq!(h.loader.instance("web"), instance);
    assert_eq!(*http.applied.lock(), vec![yaml("port: 80")]);
    assert_eq!(*http.reconfigured.lock(), vec![yaml("port: 81")]);
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn external_dispose_clears_instance() {
    let mut h = harness(MemoryStore::with(vec![Entry::new("web", "http")]));
    h.registry.register("http", Arc::new(Recorder::default()));
    h.loader.start().await.unwrap();
    let instance = h.loader.instance("web").unwrap();

    h.tree.dispose(instance);
    h.loader.process_scope_events();

    assert!(h.loader.instance("web").is_none());
    assert_eq!(h.loader.pending_full_reload(), None);
}

#[tokio::test]
async fn root_dispose_triggers_full_reload() {
    let mut h = harness(MemoryStore::with(vec![Entry::new("web", "http")]));
    h.registry.register("http", Arc::new(Recorder::default()));
    h.loader.start().await.unwrap();
    let mut events = h.loader.subscribe();

    h.tree.dispose(h.tree.root());
    let code = h.loader.run().await;

    assert_eq!(code, EXIT_CODE_FULL_RELOAD);
    assert_eq!(h.control.codes.lock().as_slice(), &[EXIT_CODE_FULL_RELOAD]);
    assert!(drain_events(&mut events).contains(&LoaderEvent::FullReload {
        code: EXIT_CODE_FULL_RELOAD
    }));
}

#[tokio::test]
async fn shutdown_unloads_without_full_reload() {
    let mut h = harness(MemoryStore::with(vec![
        Entry::new("web", "http"),
        Entry::new("db", "http"),
    ]));
    let http = Arc::new(Recorder::default());
    h.registry.register("http", http.clone());
    h.loader.start().await.unwrap();

    h.loader.shutdown();

    assert_eq!(http.disposed.load(Ordering::SeqCst), 2);
    assert!(h.tree.instances().is_empty());
    assert_eq!(h.loader.pending_full_reload(), None);
}

#[tokio::test]
async fn handle_commands_are_served_by_run() {
    let mut h = harness(MemoryStore::with(vec![Entry::new("web", "http")]));
    h.registry.register("http", Arc::new(Recorder::default()));
    h.loader.start().await.unwrap();
    let instance = h.loader.instance("web").unwrap();
    let handle = h.loader.handle();

    let client = tokio::spawn(async move {
        let paths = handle.paths(instance).await.unwrap();
        let entries = handle.entries().await.unwrap();
        handle.full_reload(52).await.unwrap();
        (paths, entries)
    });

    let code = h.loader.run().await;
    let (paths, entries) = client.await.unwrap();
    assert_eq!(code, 52);
    assert_eq!(paths, vec!["web".to_string()]);
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn config_change_after_own_write_is_skipped() {
    let mut h = harness(MemoryStore::with(vec![Entry::new("web", "http")]));
    h.registry.register("http", Arc::new(Recorder::default()));
    h.loader.start().await.unwrap();
    h.loader.write_config(true).unwrap();

    // The first notification belongs to our own write
    *h.store.entries.lock() = vec![];
    h.loader.on_config_changed().await;
    assert!(h.loader.instance("web").is_some());

    h.loader.on_config_changed().await;
    assert!(!h.loader.has_state("web"));
}

#[tokio::test]
async fn run_reloads_on_config_change() {
    let mut h = harness(MemoryStore::with(vec![Entry::new("web", "http")]));
    h.registry.register("http", Arc::new(Recorder::default()));
    h.loader.start().await.unwrap();
    *h.store.entries.lock() = vec![Entry::new("db", "http")];

    let changes = h.loader.change_sender();
    let handle = h.loader.handle();
    let mut events = h.loader.subscribe();
    let driver = tokio::spawn(async move {
        changes.send(()).await.unwrap();
        // Wait for the reload to land before asking the loop to stop
        loop {
            match events.recv().await {
                Ok(LoaderEventMessage {
                    event: LoaderEvent::Apply { id, .. },
                    ..
                }) if id == "db" => break,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
        handle.full_reload(EXIT_CODE_FULL_RELOAD).await.unwrap();
    });

    h.loader.run().await;
    driver.await.unwrap();
    assert!(h.loader.instance("db").is_some());
    assert!(!h.loader.has_state("web"));
}
