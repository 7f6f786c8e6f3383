//! Shared helpers for panewatch integration tests: an in-memory process
//! backend, recording trigger sinks and orchestrator fixtures.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use panewatch_core::Orchestrator;
use panewatch_core::OrchestratorConfig;
use panewatch_core::PaneAddress;
use panewatch_core::coordinator::SinkError;
use panewatch_core::coordinator::TriggerEvent;
use panewatch_core::coordinator::TriggerSink;
use panewatch_core::exec::Liveness;
use panewatch_core::exec::ProcessBackend;
use panewatch_core::exec::ProcessEvent;
use panewatch_core::exec::ProcessHandle;
use panewatch_core::exec::ProcessIdentity;
use panewatch_core::exec::Signal;
use panewatch_core::exec::SpawnRequest;
use panewatch_core::exec::ValidatedInput;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::sync::broadcast;

#[derive(Debug)]
struct FakePane {
    pid: u32,
    log_path: Option<PathBuf>,
    running: bool,
    adopted: bool,
    inputs: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    panes: HashMap<PaneAddress, FakePane>,
    live_pids: HashSet<u32>,
    owners: HashMap<u32, PaneAddress>,
    failing_adopts: HashSet<PaneAddress>,
    responses: Vec<(String, Vec<String>)>,
    ignore_terminate: bool,
    signals: Vec<(PaneAddress, Signal)>,
}

/// Process backend that never starts a real process. Commands written to a
/// pane can be scripted to append output to the pane's log.
#[derive(Debug)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    events: broadcast::Sender<ProcessEvent>,
    next_pid: AtomicU32,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            events,
            next_pid: AtomicU32::new(10_000),
        })
    }

    /// Any input line starting with `prefix` appends `lines` to the log.
    pub fn respond(&self, prefix: &str, lines: &[&str]) {
        self.lock().responses.push((
            prefix.to_string(),
            lines.iter().map(|line| (*line).to_string()).collect(),
        ));
    }

    /// Appends raw text to the pane's log as if the process printed it.
    pub fn emit(&self, address: &PaneAddress, text: &str) {
        let path = self
            .lock()
            .panes
            .get(address)
            .and_then(|pane| pane.log_path.clone());
        if let Some(path) = path {
            append(&path, text);
        }
    }

    /// Ends the pane's process as if it exited on its own.
    pub fn exit(&self, address: &PaneAddress, exit_code: Option<i32>) {
        let pid = {
            let mut state = self.lock();
            let Some(pane) = state.panes.get_mut(address) else {
                return;
            };
            if !pane.running {
                return;
            }
            pane.running = false;
            let pid = pane.pid;
            state.live_pids.remove(&pid);
            pid
        };
        let _ = self.events.send(ProcessEvent::Exited {
            address: address.clone(),
            pid,
            exit_code,
        });
    }

    /// Makes SIGTERM a no-op so termination has to escalate.
    pub fn ignore_terminate(&self, ignore: bool) {
        self.lock().ignore_terminate = ignore;
    }

    /// Registers a pid that probes report as alive.
    pub fn mark_alive(&self, pid: u32) {
        self.lock().live_pids.insert(pid);
    }

    pub fn mark_dead(&self, pid: u32) {
        self.lock().live_pids.remove(&pid);
    }

    /// Hands a live pid to an unrelated process, as the OS does when it
    /// recycles the pid of an exited pane.
    pub fn recycle_pid(&self, pid: u32) {
        let mut state = self.lock();
        state.owners.remove(&pid);
        state.live_pids.insert(pid);
    }

    /// Makes adoption of `address` fail.
    pub fn fail_adopt(&self, address: &PaneAddress) {
        self.lock().failing_adopts.insert(address.clone());
    }

    /// Every signal sent through the backend, in order.
    pub fn signals(&self) -> Vec<(PaneAddress, Signal)> {
        self.lock().signals.clone()
    }

    pub fn inputs(&self, address: &PaneAddress) -> Vec<String> {
        self.lock()
            .panes
            .get(address)
            .map(|pane| pane.inputs.clone())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, address: &PaneAddress) -> bool {
        self.lock().panes.contains_key(address)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open fake pane log");
    file.write_all(text.as_bytes())
        .expect("write fake pane log");
}

#[async_trait]
impl ProcessBackend for FakeBackend {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<ProcessHandle> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        append(&request.log_path, "");
        let mut state = self.lock();
        state.live_pids.insert(pid);
        state.owners.insert(pid, request.address.clone());
        state.panes.insert(
            request.address,
            FakePane {
                pid,
                log_path: Some(request.log_path),
                running: true,
                adopted: false,
                inputs: Vec::new(),
            },
        );
        Ok(ProcessHandle {
            pid,
            started_at: Utc::now(),
        })
    }

    async fn write(&self, address: &PaneAddress, input: &ValidatedInput) -> anyhow::Result<()> {
        let text = String::from_utf8_lossy(input.as_bytes()).into_owned();
        let (log_path, output) = {
            let mut state = self.lock();
            let responses = state.responses.clone();
            let pane = state
                .panes
                .get_mut(address)
                .ok_or_else(|| anyhow!("pane {address} is not tracked"))?;
            if pane.adopted {
                return Err(anyhow!("pane {address} was adopted and has no input channel"));
            }
            if !pane.running {
                return Err(anyhow!("pane {address} has exited"));
            }
            pane.inputs.push(text.clone());
            let output: Vec<String> = text
                .lines()
                .flat_map(|line| {
                    responses
                        .iter()
                        .filter(move |(prefix, _)| line.starts_with(prefix.as_str()))
                        .flat_map(|(_, lines)| lines.iter().cloned())
                })
                .collect();
            (pane.log_path.clone(), output)
        };
        if let Some(path) = log_path {
            for line in output {
                append(&path, &format!("{line}\n"));
            }
        }
        Ok(())
    }

    async fn signal(&self, address: &PaneAddress, signal: Signal) -> anyhow::Result<()> {
        {
            let mut state = self.lock();
            state.signals.push((address.clone(), signal));
            if signal == Signal::Terminate && state.ignore_terminate {
                return Ok(());
            }
        }
        self.exit(address, None);
        Ok(())
    }

    async fn is_running(&self, address: &PaneAddress) -> bool {
        self.lock()
            .panes
            .get(address)
            .is_some_and(|pane| pane.running)
    }

    async fn probe(&self, identity: &ProcessIdentity) -> Liveness {
        let state = self.lock();
        if !state.live_pids.contains(&identity.pid) {
            return Liveness::Dead;
        }
        match state.owners.get(&identity.pid) {
            Some(owner) if *owner == identity.address => Liveness::Alive,
            _ => Liveness::Foreign,
        }
    }

    async fn adopt(&self, address: &PaneAddress, pid: u32) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.failing_adopts.contains(address) {
            return Err(anyhow!("pane {address} could not be adopted"));
        }
        let running = state.live_pids.contains(&pid);
        state.panes.insert(
            address.clone(),
            FakePane {
                pid,
                log_path: None,
                running,
                adopted: true,
                inputs: Vec::new(),
            },
        );
        Ok(())
    }

    async fn release(&self, address: &PaneAddress) {
        self.lock().panes.remove(address);
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }
}

/// Sink that keeps every delivered event.
#[derive(Debug)]
pub struct RecordingSink {
    id: String,
    events: Mutex<Vec<TriggerEvent>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn events(&self) -> Vec<TriggerEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Waits until at least `count` events arrived or the timeout passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<TriggerEvent> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.events().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.events()
    }
}

#[async_trait]
impl TriggerSink for RecordingSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &TriggerEvent) -> Result<(), SinkError> {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Sink whose deliveries always fail.
#[derive(Debug)]
pub struct FailingSink {
    id: String,
}

impl FailingSink {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self { id: id.to_string() })
    }
}

#[async_trait]
impl TriggerSink for FailingSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, _event: &TriggerEvent) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }
}

/// Config tuned for fast tests, rooted at `state_dir`.
pub fn test_config(state_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        state_dir: state_dir.to_path_buf(),
        grace_timeout_ms: 200,
        watch_poll_interval_ms: 10,
        snapshot_debounce_ms: 50,
        sink_timeout_ms: 500,
        port_probe_interval_ms: 20,
        ..OrchestratorConfig::default()
    }
}

/// An orchestrator on a [`FakeBackend`] with a recording sink named `ops`.
pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<FakeBackend>,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        Self::in_dir(dir, FakeBackend::new())
    }

    /// Builds over an existing state dir and backend, as a restart would.
    pub fn in_dir(dir: TempDir, backend: Arc<FakeBackend>) -> Self {
        let sink = RecordingSink::new("ops");
        let orchestrator = Orchestrator::builder(test_config(dir.path()))
            .backend(backend.clone())
            .sink(sink.clone())
            .build()
            .expect("build orchestrator");
        Self {
            dir,
            backend,
            sink,
            orchestrator,
        }
    }

    /// Shuts the orchestrator down, handing back the state dir and backend.
    pub async fn restart(self) -> Self {
        self.orchestrator.shutdown().await;
        Self::in_dir(self.dir, self.backend)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn pane(address: &str) -> PaneAddress {
    address.parse().expect("pane address")
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
