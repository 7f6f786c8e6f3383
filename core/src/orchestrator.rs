//! Top-level wiring. An [`Orchestrator`] owns the registry, the executor, the
//! classification pipeline, the trigger coordinator and persistence, and
//! exposes every caller-facing operation.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::address::PaneAddress;
use crate::address::WindowAddress;
use crate::classifier::ErrorAnalysis;
use crate::classifier::ErrorHistory;
use crate::classifier::ErrorSummary;
use crate::classifier::LanguageFilter;
use crate::classifier::PatternChange;
use crate::classifier::PatternSet;
use crate::classifier::PatternSpec;
use crate::classifier::Severity;
use crate::classifier::spawn_classifier;
use crate::config::OrchestratorConfig;
use crate::config::SinkKind;
use crate::coordinator::CoordinatorConfig;
use crate::coordinator::CoordinatorHandle;
use crate::coordinator::JsonLinesSink;
use crate::coordinator::LineWriter;
use crate::coordinator::LifecycleEvent;
use crate::coordinator::LifecycleKind;
use crate::coordinator::RuleStatus;
use crate::coordinator::TracingSink;
use crate::coordinator::TriggerEvent;
use crate::coordinator::TriggerRule;
use crate::coordinator::TriggerSink;
use crate::coordinator::spawn_coordinator;
use crate::error::ErrorKind;
use crate::error::OrchestratorError;
use crate::error::Result;
use crate::error::StoreError;
use crate::exec::CommandExecutor;
use crate::exec::CommandPolicy;
use crate::exec::ProcessBackend;
use crate::exec::ProcessEvent;
use crate::exec::PtyBackend;
use crate::exec::SpawnRequest;
use crate::exec::TerminationOutcome;
use crate::exec::ValidatedCommand;
use crate::monitor::spawn_port_monitor;
use crate::persistence::JsonDirStore;
use crate::persistence::PersistenceService;
use crate::persistence::RecoveryReport;
use crate::persistence::SessionStore;
use crate::persistence::spawn_persistence_task;
use crate::registry::Pane;
use crate::registry::PaneOrigin;
use crate::registry::Session;
use crate::registry::SessionRegistry;
use crate::registry::Window;
use crate::watcher::LogWatcher;
use crate::watcher::StreamPosition;
use crate::watcher::WatchOptions;
use crate::watcher::WatcherState;

pub const DEFAULT_WINDOW: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
    pub pane: PaneAddress,
    pub state: WatcherState,
    pub languages: Vec<String>,
    /// Log offset the watch started from, or stopped at.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneTermination {
    pub pane: PaneAddress,
    pub outcome: TerminationOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyReport {
    pub session: String,
    pub panes: Vec<PaneTermination>,
}

struct ActiveWatch {
    watcher: LogWatcher,
    classifier: JoinHandle<()>,
    languages: LanguageFilter,
}

impl ActiveWatch {
    async fn finish(self) -> StreamPosition {
        let position = self.watcher.shutdown().await;
        // The classifier ends once the watcher drops its line sender.
        let _ = self.classifier.await;
        position
    }
}

#[derive(Default)]
struct WatchTable {
    active: HashMap<PaneAddress, ActiveWatch>,
    /// Where a stopped watch left off.
    offsets: HashMap<PaneAddress, StreamPosition>,
}

type MonitorKey = (PaneAddress, u16);

struct PortMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PortMonitor {
    async fn stop(self, (pane, port): &MonitorKey) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(pane = %pane, port, "port monitor task failed: {err}");
        }
        debug!(pane = %pane, port, "port monitor joined");
    }
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    backend: Option<Arc<dyn ProcessBackend>>,
    store: Option<Arc<dyn SessionStore>>,
    sinks: Vec<Arc<dyn TriggerSink>>,
    output: Option<LineWriter>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            backend: None,
            store: None,
            sinks: Vec::new(),
            output: None,
        }
    }

    /// Defaults to [`PtyBackend`].
    pub fn backend(mut self, backend: Arc<dyn ProcessBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Defaults to a [`JsonDirStore`] under the configured sessions dir.
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TriggerSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Where `stdout` sinks write. Pass the writer that carries operation
    /// responses so both streams share one line lock. Defaults to a fresh
    /// [`LineWriter::stdout`].
    pub fn output(mut self, output: LineWriter) -> Self {
        self.output = Some(output);
        self
    }

    /// Starts the background tasks; must run inside a Tokio runtime.
    pub fn build(self) -> Result<Orchestrator> {
        let Self {
            config,
            backend,
            store,
            sinks: extra_sinks,
            output,
        } = self;
        let config = Arc::new(config);

        let policy = CommandPolicy::new(&config.command_policy)?;
        let backend: Arc<dyn ProcessBackend> = match backend {
            Some(backend) => backend,
            None => Arc::new(PtyBackend::new(&config)),
        };
        let executor = Arc::new(CommandExecutor::new(backend, policy));
        let registry = Arc::new(SessionRegistry::new());
        let patterns = Arc::new(PatternSet::with_builtins()?);
        let history = Arc::new(ErrorHistory::new(config.ring_capacity));
        let cancel = CancellationToken::new();

        let output = output.unwrap_or_else(LineWriter::stdout);
        let mut sinks: Vec<Arc<dyn TriggerSink>> = config
            .sinks
            .iter()
            .map(|sink| -> Arc<dyn TriggerSink> {
                match sink.kind {
                    SinkKind::Log => Arc::new(TracingSink::new(&sink.id)),
                    SinkKind::Stdout => Arc::new(JsonLinesSink::new(&sink.id, output.clone())),
                }
            })
            .collect();
        sinks.extend(extra_sinks);
        let (coordinator, coordinator_task) = spawn_coordinator(
            CoordinatorConfig {
                counter_window: config.counter_window(),
                default_debounce: config.default_debounce(),
                sink_timeout: config.sink_timeout(),
                entry_channel_capacity: config.entry_channel_capacity,
            },
            sinks,
            cancel.clone(),
        );

        let store: Arc<dyn SessionStore> = match store {
            Some(store) => store,
            None => Arc::new(JsonDirStore::new(config.sessions_dir())),
        };
        let persistence = PersistenceService::new(store, registry.clone());
        let persistence_task = spawn_persistence_task(
            persistence.clone(),
            registry.subscribe(),
            config.snapshot_debounce(),
            config.snapshot_interval(),
            cancel.clone(),
        );

        let watches = Arc::new(Mutex::new(WatchTable::default()));
        let lifecycle_task = spawn_lifecycle_task(
            executor.subscribe(),
            executor.clone(),
            coordinator.clone(),
            watches.clone(),
            cancel.clone(),
        );

        info!(state_dir = %config.state_dir.display(), "orchestrator started");
        Ok(Orchestrator {
            config,
            registry,
            executor,
            patterns,
            history,
            coordinator,
            persistence,
            watches,
            monitors: Mutex::new(HashMap::new()),
            cancel,
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(vec![coordinator_task, persistence_task, lifecycle_task]),
        })
    }
}

pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    registry: Arc<SessionRegistry>,
    executor: Arc<CommandExecutor>,
    patterns: Arc<PatternSet>,
    history: Arc<ErrorHistory>,
    coordinator: CoordinatorHandle,
    persistence: PersistenceService,
    watches: Arc<Mutex<WatchTable>>,
    monitors: Mutex<HashMap<MonitorKey, PortMonitor>>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state_dir", &self.config.state_dir)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Readopts every stored session whose panes are still running.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.ensure_running()?;
        let report = self.persistence.recover(&self.executor).await?;
        info!(
            recovered = report.recovered.len(),
            discarded = report.discarded.len(),
            "recovery finished"
        );
        Ok(report)
    }

    pub async fn create_session(
        &self,
        name: Option<String>,
        working_dir: Option<PathBuf>,
        windows: Vec<String>,
    ) -> Result<Session> {
        self.ensure_running()?;
        let name = name.unwrap_or_else(generate_session_name);
        let windows = if windows.is_empty() {
            vec![DEFAULT_WINDOW.to_string()]
        } else {
            windows
        };
        let working_dir = match working_dir {
            Some(dir) => dir,
            None => std::env::current_dir().unwrap_or_else(|_| self.config.state_dir.clone()),
        };

        self.registry
            .create_session(&name, working_dir.clone(), &windows)
            .await?;
        for window in &windows {
            let opened = match WindowAddress::new(&name, window) {
                Ok(address) => self.open_pane(&address, &working_dir, BTreeMap::new()).await,
                Err(err) => Err(err),
            };
            if let Err(err) = opened {
                warn!(session = %name, "session creation failed: {err}");
                let _ = self.teardown_session(&name).await;
                return Err(err);
            }
        }
        info!(session = %name, windows = windows.len(), "session created");
        self.registry.session(&name).await
    }

    /// Adds a window with one shell pane.
    pub async fn create_window(&self, address: &WindowAddress) -> Result<Window> {
        self.ensure_running()?;
        self.registry.add_window(address).await?;
        let working_dir = self.registry.session(address.session()).await?.working_dir;
        if let Err(err) = self.open_pane(address, &working_dir, BTreeMap::new()).await {
            let _ = self.registry.remove_window(address).await;
            return Err(err);
        }
        self.registry
            .session(address.session())
            .await?
            .windows
            .shift_remove(address.window())
            .ok_or_else(|| OrchestratorError::window_not_found(address))
    }

    /// Adds a pane to `window`, optionally running `command` in it. The
    /// command is validated before anything is spawned.
    pub async fn create_pane(
        &self,
        window: &WindowAddress,
        command: Option<&str>,
        env: BTreeMap<String, String>,
    ) -> Result<Pane> {
        self.ensure_running()?;
        let command = command
            .map(|command| self.executor.policy().validate_command(command))
            .transpose()?;
        let working_dir = self.registry.session(window.session()).await?.working_dir;
        let pane = self.open_pane(window, &working_dir, env).await?;
        match command {
            Some(command) => self.dispatch(&pane.address, &command).await,
            None => Ok(pane),
        }
    }

    /// Removes a window and terminates every pane in it. Its pane numbering
    /// is retired with it, so a re-added window starts past the old indices.
    pub async fn remove_window(&self, address: &WindowAddress) -> Result<Vec<PaneTermination>> {
        self.ensure_running()?;
        let window = self.registry.remove_window(address).await?;
        let panes: Vec<PaneAddress> = window
            .panes
            .values()
            .map(|pane| pane.address.clone())
            .collect();
        for pane in &panes {
            self.stop_watch(pane).await;
        }
        self.stop_monitors(|pane| panes.contains(pane)).await;

        let grace = self.config.grace_timeout();
        let outcomes = join_all(panes.iter().map(|address| async move {
            let outcome = self.executor.terminate(address, grace).await;
            let _ = self.coordinator.forget_pane(address).await;
            self.history.forget(address);
            PaneTermination {
                pane: address.clone(),
                outcome,
            }
        }))
        .await;

        let mut watches = self.watches.lock().await;
        for pane in &panes {
            watches.offsets.remove(pane);
        }
        drop(watches);
        info!(window = %address, panes = outcomes.len(), "window removed");
        Ok(outcomes)
    }

    pub async fn remove_pane(&self, address: &PaneAddress) -> Result<Pane> {
        self.ensure_running()?;
        let pane = self.registry.remove_pane(address).await?;
        self.stop_watch(address).await;
        self.stop_monitors(|pane| pane == address).await;
        let outcome = self
            .executor
            .terminate(address, self.config.grace_timeout())
            .await;
        let _ = self.coordinator.forget_pane(address).await;
        self.history.forget(address);
        self.watches.lock().await.offsets.remove(address);
        info!(pane = %address, %outcome, "pane removed");
        Ok(pane)
    }

    pub async fn select_pane(&self, address: &PaneAddress) -> Result<()> {
        self.ensure_running()?;
        self.registry.select_pane(address).await
    }

    /// Runs `command` in the pane's shell. A spawned pane whose shell has
    /// exited gets a fresh shell first; recovered panes accept no input.
    pub async fn execute_command(&self, address: &PaneAddress, command: &str) -> Result<Pane> {
        self.ensure_running()?;
        let command = self.executor.policy().validate_command(command)?;
        let pane = self.registry.resolve(address).await?;
        if pane.origin == PaneOrigin::Spawned && !self.executor.is_running(address).await {
            self.respawn(&pane).await?;
        }
        self.dispatch(address, &command).await
    }

    pub async fn send_input(&self, address: &PaneAddress, input: &[u8]) -> Result<()> {
        self.ensure_running()?;
        self.registry.resolve(address).await?;
        self.executor.send_input(address, input).await
    }

    /// Tears down a session: its record goes first, then watchers, monitors
    /// and processes. Destroying an unknown session reports `not_found`.
    pub async fn destroy_session(&self, name: &str) -> Result<DestroyReport> {
        self.ensure_running()?;
        let report = self.teardown_session(name).await?;
        info!(session = %name, panes = report.panes.len(), "session destroyed");
        Ok(report)
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.registry.list().await
    }

    pub async fn resolve_pane(&self, address: &PaneAddress) -> Result<Pane> {
        self.registry.resolve(address).await
    }

    /// Starts (or restarts) classification of the pane's output. A restarted
    /// watch resumes where the previous one stopped.
    pub async fn errors_watch(
        &self,
        address: &PaneAddress,
        languages: Vec<String>,
        duration: Option<Duration>,
    ) -> Result<WatchStatus> {
        self.ensure_running()?;
        let pane = self.registry.resolve(address).await?;
        let languages = LanguageFilter::new(languages);

        let mut table = self.watches.lock().await;
        let start = match table.active.remove(address) {
            Some(previous) => previous.finish().await,
            None => table.offsets.get(address).copied().unwrap_or_default(),
        };
        let (line_tx, line_rx) = mpsc::channel(self.config.line_channel_capacity.max(1));
        let watcher = LogWatcher::spawn(
            address.clone(),
            pane.log_path.clone(),
            start,
            WatchOptions {
                poll_interval: self.config.watch_poll_interval(),
                duration,
                max_line_bytes: self.config.max_line_bytes,
            },
            line_tx,
        );
        let classifier = spawn_classifier(
            address.clone(),
            self.patterns.clone(),
            languages.clone(),
            self.history.clone(),
            line_rx,
            self.coordinator.entries(),
        );
        let status = WatchStatus {
            pane: address.clone(),
            state: watcher.state(),
            languages: languages.languages().to_vec(),
            offset: start.offset,
        };
        table.active.insert(
            address.clone(),
            ActiveWatch {
                watcher,
                classifier,
                languages,
            },
        );
        info!(
            pane = %address,
            offset = start.offset,
            line_no = start.line_no,
            ?duration,
            "watching pane output"
        );
        Ok(status)
    }

    pub async fn errors_unwatch(&self, address: &PaneAddress) -> Result<WatchStatus> {
        self.ensure_running()?;
        let mut table = self.watches.lock().await;
        let watch = table
            .active
            .remove(address)
            .ok_or_else(|| OrchestratorError::WatchNotFound {
                address: address.to_string(),
            })?;
        let languages = watch.languages.languages().to_vec();
        let position = watch.finish().await;
        table.offsets.insert(address.clone(), position);
        info!(pane = %address, offset = position.offset, "stopped watching pane output");
        Ok(WatchStatus {
            pane: address.clone(),
            state: WatcherState::Stopped,
            languages,
            offset: position.offset,
        })
    }

    pub async fn watch_status(&self, address: &PaneAddress) -> Option<WatchStatus> {
        let table = self.watches.lock().await;
        table.active.get(address).map(|watch| WatchStatus {
            pane: address.clone(),
            state: watch.watcher.state(),
            languages: watch.languages.languages().to_vec(),
            offset: watch.watcher.position().offset,
        })
    }

    pub fn errors_add_pattern(&self, spec: PatternSpec) -> Result<PatternChange> {
        self.ensure_running()?;
        let name = spec.name.clone();
        let change = self.patterns.add(spec)?;
        info!(pattern = %name, ?change, "error pattern registered");
        Ok(change)
    }

    /// Returns whether a pattern was removed; unknown names are a no-op.
    pub fn errors_remove_pattern(&self, name: &str) -> bool {
        self.patterns.remove(name)
    }

    pub fn errors_list_patterns(&self) -> Vec<PatternSpec> {
        self.patterns.list()
    }

    pub async fn errors_summary(
        &self,
        address: &PaneAddress,
        min_severity: Option<Severity>,
        limit: Option<usize>,
    ) -> Result<ErrorSummary> {
        self.registry.resolve(address).await?;
        Ok(self.history.summary(address, min_severity, limit))
    }

    pub async fn errors_analyze(&self, address: &PaneAddress) -> Result<ErrorAnalysis> {
        self.registry.resolve(address).await?;
        Ok(self.history.analyze(address))
    }

    pub async fn add_trigger_rule(&self, rule: TriggerRule) -> Result<()> {
        self.ensure_running()?;
        self.coordinator.add_rule(rule).await
    }

    pub async fn remove_trigger_rule(&self, id: &str) -> Result<TriggerRule> {
        self.ensure_running()?;
        self.coordinator.remove_rule(id).await
    }

    pub async fn list_trigger_rules(&self) -> Result<Vec<RuleStatus>> {
        self.coordinator.list_rules().await
    }

    pub async fn recent_triggers(&self, limit: usize) -> Result<Vec<TriggerEvent>> {
        self.coordinator.recent_triggers(limit).await
    }

    pub async fn register_sink(&self, sink: Arc<dyn TriggerSink>) -> Result<()> {
        self.coordinator.register_sink(sink).await
    }

    /// Probes `port` for the pane until the pane goes away. Monitoring the
    /// same port again restarts the probe.
    pub async fn monitor_port(
        &self,
        address: &PaneAddress,
        port: u16,
        interval: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.registry.resolve(address).await?;
        let cancel = self.cancel.child_token();
        let interval = interval.unwrap_or_else(|| self.config.port_probe_interval());
        let task = spawn_port_monitor(
            address.clone(),
            port,
            interval,
            self.coordinator.clone(),
            cancel.clone(),
        );
        let key = (address.clone(), port);
        let previous = self
            .monitors
            .lock()
            .await
            .insert(key.clone(), PortMonitor { cancel, task });
        if let Some(previous) = previous {
            previous.stop(&key).await;
        }
        info!(pane = %address, port, ?interval, "monitoring port");
        Ok(())
    }

    pub async fn snapshot_all(&self) -> Result<usize> {
        Ok(self.persistence.snapshot_all().await?)
    }

    /// Stops every watcher and background task after a final snapshot. Pane
    /// processes are left running so a later start can recover them.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let watches: Vec<(PaneAddress, ActiveWatch)> = {
            let mut table = self.watches.lock().await;
            table.active.drain().collect()
        };
        for (address, watch) in watches {
            let position = watch.finish().await;
            self.watches.lock().await.offsets.insert(address, position);
        }
        self.stop_monitors(|_| true).await;
        match self.persistence.snapshot_all().await {
            Ok(written) => debug!(written, "final snapshot written"),
            Err(err) => warn!(kind = %ErrorKind::Storage, "final snapshot failed: {err}"),
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(OrchestratorError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn open_pane(
        &self,
        window: &WindowAddress,
        working_dir: &Path,
        env: BTreeMap<String, String>,
    ) -> Result<Pane> {
        let address = self.registry.reserve_pane(window).await?;
        let log_path = self.config.logs_dir().join(address.log_relative_path());
        if let Some(dir) = log_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| StoreError::write(dir, err))?;
        }
        // Leftovers from an earlier session of the same name must not be
        // classified again.
        tokio::fs::File::create(&log_path)
            .await
            .map_err(|err| StoreError::write(&log_path, err))?;

        let handle = self
            .executor
            .spawn(SpawnRequest {
                address: address.clone(),
                working_dir: working_dir.to_path_buf(),
                env: env.clone(),
                log_path: log_path.clone(),
            })
            .await?;
        let pane = Pane {
            address,
            command: None,
            pid: handle.pid,
            log_path,
            env,
            created_at: handle.started_at,
            started_at: handle.started_at,
            origin: PaneOrigin::Spawned,
        };
        if let Err(err) = self.registry.insert_pane(pane.clone()).await {
            self.executor
                .terminate(&pane.address, self.config.grace_timeout())
                .await;
            return Err(err);
        }
        Ok(pane)
    }

    async fn respawn(&self, pane: &Pane) -> Result<()> {
        let working_dir = self
            .registry
            .session(pane.address.session())
            .await?
            .working_dir;
        let handle = self
            .executor
            .spawn(SpawnRequest {
                address: pane.address.clone(),
                working_dir,
                env: pane.env.clone(),
                log_path: pane.log_path.clone(),
            })
            .await?;
        self.registry
            .update_pane(&pane.address, |pane| {
                pane.pid = handle.pid;
                pane.started_at = handle.started_at;
            })
            .await?;
        info!(pane = %pane.address, pid = handle.pid, "pane shell respawned");
        Ok(())
    }

    async fn dispatch(&self, address: &PaneAddress, command: &ValidatedCommand) -> Result<Pane> {
        self.executor.run(address, command).await?;
        let line = command.as_str().to_string();
        self.registry
            .update_pane(address, move |pane| pane.command = Some(line))
            .await
    }

    async fn teardown_session(&self, name: &str) -> Result<DestroyReport> {
        let session = self.registry.destroy_session(name).await?;
        if let Err(err) = self.persistence.remove(name).await {
            warn!(kind = %ErrorKind::Storage, session = %name, "{err}");
        }

        let panes: Vec<PaneAddress> = session.panes().map(|pane| pane.address.clone()).collect();
        for address in &panes {
            self.stop_watch(address).await;
        }
        self.stop_monitors(|pane| pane.session() == name).await;

        let grace = self.config.grace_timeout();
        let outcomes = join_all(panes.into_iter().map(|address| async move {
            let outcome = self.executor.terminate(&address, grace).await;
            PaneTermination {
                pane: address,
                outcome,
            }
        }))
        .await;

        let _ = self.coordinator.forget_session(name).await;
        self.history.forget_session(name);
        self.watches
            .lock()
            .await
            .offsets
            .retain(|pane, _| pane.session() != name);
        Ok(DestroyReport {
            session: name.to_string(),
            panes: outcomes,
        })
    }

    async fn stop_watch(&self, address: &PaneAddress) {
        let watch = self.watches.lock().await.active.remove(address);
        if let Some(watch) = watch {
            let position = watch.finish().await;
            debug!(pane = %address, offset = position.offset, "watch cancelled");
        }
    }

    async fn stop_monitors<F>(&self, matches: F)
    where
        F: Fn(&PaneAddress) -> bool,
    {
        let stopped: Vec<(MonitorKey, PortMonitor)> = {
            let mut monitors = self.monitors.lock().await;
            let keys: Vec<MonitorKey> = monitors
                .keys()
                .filter(|(pane, _)| matches(pane))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| monitors.remove(&key).map(|monitor| (key, monitor)))
                .collect()
        };
        for (key, monitor) in stopped {
            monitor.stop(&key).await;
        }
    }
}

fn generate_session_name() -> String {
    format!("session-{}", Uuid::new_v4().simple())
}

/// Routes process exits: expected ones (requested terminations) are only
/// logged, the rest become `ProcessExited` lifecycle events. Either way the
/// pane's watcher is flushed so a trailing partial line is not lost.
fn spawn_lifecycle_task(
    mut events: broadcast::Receiver<ProcessEvent>,
    executor: Arc<CommandExecutor>,
    coordinator: CoordinatorHandle,
    watches: Arc<Mutex<WatchTable>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ProcessEvent::Exited {
                    address,
                    pid,
                    exit_code,
                }) => {
                    if let Some(watch) = watches.lock().await.active.get(&address) {
                        watch.watcher.flush();
                    }
                    if executor.take_expected_exit(&address) {
                        debug!(pane = %address, pid, ?exit_code, "pane process exited on request");
                        continue;
                    }
                    warn!(pane = %address, pid, ?exit_code, "pane process exited unexpectedly");
                    let event = LifecycleEvent {
                        pane: address,
                        kind: LifecycleKind::ProcessExited { pid, exit_code },
                        at: Utc::now(),
                    };
                    if coordinator.lifecycle(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lifecycle task lagged behind process events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("lifecycle task stopped");
    })
}
