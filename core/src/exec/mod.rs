//! Command execution inside panes.
//!
//! A pane is an interactive shell owned by a [`ProcessBackend`]; commands are
//! written to it as input lines after passing the [`CommandPolicy`].

mod policy;
mod pty;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::PaneAddress;
use crate::error::OrchestratorError;
use crate::error::Result;

pub use policy::CommandPolicy;
pub use policy::PendingLine;
pub use policy::ValidatedCommand;
pub use policy::ValidatedInput;
pub use policy::escape;
pub use pty::PtyBackend;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub address: PaneAddress,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// File the backend appends all pane output to.
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The pid is running but belongs to some other process, typically one
    /// that reused the pid after the pane's process died.
    Foreign,
}

/// What a persisted pane's process must look like to be adopted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub address: PaneAddress,
    pub pid: u32,
    /// Recorded right after the process was spawned, so the real process
    /// start can only be earlier.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Exited {
        address: PaneAddress,
        pid: u32,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    AlreadyExited,
    Graceful,
    ForceKilled,
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationOutcome::AlreadyExited => write!(f, "already_exited"),
            TerminationOutcome::Graceful => write!(f, "graceful"),
            TerminationOutcome::ForceKilled => write!(f, "force_killed"),
        }
    }
}

/// Process plumbing behind the executor. Implementations publish every exit
/// of a tracked pane as a [`ProcessEvent`].
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<ProcessHandle>;

    async fn write(&self, address: &PaneAddress, input: &ValidatedInput) -> anyhow::Result<()>;

    async fn signal(&self, address: &PaneAddress, signal: Signal) -> anyhow::Result<()>;

    async fn is_running(&self, address: &PaneAddress) -> bool;

    /// Checks that `identity.pid` is still running and is the pane's own
    /// process rather than an unrelated one that reused the pid.
    async fn probe(&self, identity: &ProcessIdentity) -> Liveness;

    /// Starts tracking a process this backend did not spawn.
    async fn adopt(&self, address: &PaneAddress, pid: u32) -> anyhow::Result<()>;

    /// Stops tracking the pane and drops any handles held for it.
    async fn release(&self, address: &PaneAddress);

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent>;
}

pub struct CommandExecutor {
    backend: Arc<dyn ProcessBackend>,
    policy: CommandPolicy,
    expected_exits: StdMutex<HashSet<PaneAddress>>,
    /// Partially typed line per pane. Held across the backend write so input
    /// to one pane is validated and written in order.
    pending_lines: Mutex<HashMap<PaneAddress, PendingLine>>,
}

impl CommandExecutor {
    pub fn new(backend: Arc<dyn ProcessBackend>, policy: CommandPolicy) -> Self {
        Self {
            backend,
            policy,
            expected_exits: StdMutex::new(HashSet::new()),
            pending_lines: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.backend.subscribe()
    }

    pub async fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle> {
        let address = request.address.clone();
        self.clear_expected_exit(&address);
        self.pending_lines.lock().await.remove(&address);
        let handle = self
            .backend
            .spawn(request)
            .await
            .map_err(|err| OrchestratorError::spawn_failed(&address, err))?;
        info!(pane = %address, pid = handle.pid, "pane process spawned");
        Ok(handle)
    }

    /// Sends `command` to the pane's shell as one input line. Text already
    /// pending on the line is validated together with the command.
    pub async fn run(&self, address: &PaneAddress, command: &ValidatedCommand) -> Result<()> {
        let mut pending = self.pending_lines.lock().await;
        if let Some(line) = pending.get(address) {
            self.policy.validate_on_line(line, command)?;
        }
        self.write(address, &ValidatedInput::from(command)).await?;
        pending.remove(address);
        debug!(pane = %address, command = command.as_str(), "command dispatched");
        Ok(())
    }

    /// Writes raw input to the pane. Lines are assembled across calls and
    /// each completed line must pass the policy before its terminator is sent.
    pub async fn send_input(&self, address: &PaneAddress, input: &[u8]) -> Result<()> {
        let mut pending = self.pending_lines.lock().await;
        let current = pending.get(address).cloned().unwrap_or_default();
        let (input, line) = self.policy.validate_input(&current, input)?;
        self.write(address, &input).await?;
        if line.is_empty() {
            pending.remove(address);
        } else {
            pending.insert(address.clone(), line);
        }
        Ok(())
    }

    async fn write(&self, address: &PaneAddress, input: &ValidatedInput) -> Result<()> {
        self.backend
            .write(address, input)
            .await
            .map_err(|err| OrchestratorError::process_unavailable(address, err.to_string()))
    }

    pub async fn is_running(&self, address: &PaneAddress) -> bool {
        self.backend.is_running(address).await
    }

    pub async fn probe(&self, identity: &ProcessIdentity) -> Liveness {
        self.backend.probe(identity).await
    }

    pub async fn adopt(&self, address: &PaneAddress, pid: u32) -> Result<()> {
        self.backend
            .adopt(address, pid)
            .await
            .map_err(|err| OrchestratorError::process_unavailable(address, err.to_string()))
    }

    /// Stops tracking the pane without signalling its process.
    pub async fn release(&self, address: &PaneAddress) {
        self.pending_lines.lock().await.remove(address);
        self.backend.release(address).await;
    }

    /// SIGTERM, wait up to `grace`, then force-kill. A missed grace window is
    /// logged and reported through the outcome, never as an error.
    pub async fn terminate(&self, address: &PaneAddress, grace: Duration) -> TerminationOutcome {
        self.pending_lines.lock().await.remove(address);
        if !self.backend.is_running(address).await {
            self.backend.release(address).await;
            return TerminationOutcome::AlreadyExited;
        }

        self.mark_expected_exit(address);
        let mut events = self.backend.subscribe();
        if let Err(err) = self.backend.signal(address, Signal::Terminate).await {
            warn!(pane = %address, "failed to deliver SIGTERM: {err:#}");
        }

        let exited = tokio::time::timeout(grace, self.wait_for_exit(address, &mut events)).await;
        let outcome = match exited {
            Ok(()) => TerminationOutcome::Graceful,
            Err(_) => {
                let timeout = OrchestratorError::Timeout {
                    address: address.to_string(),
                    grace,
                };
                warn!(pane = %address, "{timeout}; escalating to force kill");
                if let Err(err) = self.backend.signal(address, Signal::Kill).await {
                    warn!(pane = %address, "force kill failed: {err:#}");
                }
                TerminationOutcome::ForceKilled
            }
        };
        self.backend.release(address).await;
        info!(pane = %address, %outcome, "pane process terminated");
        outcome
    }

    /// Returns true once if the last exit of `address` was requested through
    /// [`CommandExecutor::terminate`].
    pub fn take_expected_exit(&self, address: &PaneAddress) -> bool {
        match self.expected_exits.lock() {
            Ok(mut guard) => guard.remove(address),
            Err(poisoned) => poisoned.into_inner().remove(address),
        }
    }

    fn mark_expected_exit(&self, address: &PaneAddress) {
        match self.expected_exits.lock() {
            Ok(mut guard) => guard.insert(address.clone()),
            Err(poisoned) => poisoned.into_inner().insert(address.clone()),
        };
    }

    fn clear_expected_exit(&self, address: &PaneAddress) {
        let _ = self.take_expected_exit(address);
    }

    async fn wait_for_exit(
        &self,
        address: &PaneAddress,
        events: &mut broadcast::Receiver<ProcessEvent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ProcessEvent::Exited { address: exited, .. }) if &exited == address => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {
                    if !self.backend.is_running(address).await {
                        return;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
