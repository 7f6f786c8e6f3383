use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::Liveness;
use super::ProcessBackend;
use super::ProcessEvent;
use super::ProcessHandle;
use super::ProcessIdentity;
use super::Signal;
use super::SpawnRequest;
use super::ValidatedInput;
use crate::address::PaneAddress;
use crate::config::OrchestratorConfig;

const PANE_ENV_VAR: &str = "PANEWATCH_PANE";
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Boot time in /proc/stat has whole-second resolution.
const START_TIME_SLACK_SECS: i64 = 2;

struct SpawnedPane {
    pid: u32,
    writer_tx: mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
    _master: Box<dyn MasterPty + Send>,
}

struct AdoptedPane {
    pid: u32,
    exited: Arc<AtomicBool>,
    cancel: CancellationToken,
}

enum PaneProcess {
    Spawned(SpawnedPane),
    Adopted(AdoptedPane),
}

impl PaneProcess {
    fn is_running(&self) -> bool {
        match self {
            PaneProcess::Spawned(pane) => !pane.exited.load(Ordering::SeqCst),
            PaneProcess::Adopted(pane) => !pane.exited.load(Ordering::SeqCst),
        }
    }
}

/// Runs each pane as an interactive shell on its own pseudo-terminal. All
/// terminal output is appended to the pane's log file.
pub struct PtyBackend {
    shell: String,
    shell_args: Vec<String>,
    size: PtySize,
    panes: Mutex<HashMap<PaneAddress, PaneProcess>>,
    events: broadcast::Sender<ProcessEvent>,
}

impl PtyBackend {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shell: config.shell.clone(),
            shell_args: config.shell_args.clone(),
            size: PtySize {
                rows: config.pty_rows,
                cols: config.pty_cols,
                pixel_width: 0,
                pixel_height: 0,
            },
            panes: Mutex::new(HashMap::new()),
            events,
        }
    }
}

#[async_trait]
impl ProcessBackend for PtyBackend {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<ProcessHandle> {
        if let Some(parent) = request.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)
            .with_context(|| format!("failed to open log {}", request.log_path.display()))?;

        let pair = native_pty_system().openpty(self.size)?;
        let mut builder = CommandBuilder::new(&self.shell);
        builder.args(&self.shell_args);
        builder.cwd(&request.working_dir);
        for (key, value) in &request.env {
            builder.env(key, value);
        }
        builder.env(PANE_ENV_VAR, request.address.to_string());

        let mut child = pair.slave.spawn_command(builder)?;
        drop(pair.slave);
        let pid = child
            .process_id()
            .ok_or_else(|| anyhow!("spawned shell has no process id"))?;
        let killer = child.clone_killer();

        let mut reader = pair.master.try_clone_reader()?;
        let log_label = request.address.to_string();
        let reader_handle = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(err) = log.write_all(&buf[..n]).and_then(|()| log.flush()) {
                            warn!(pane = %log_label, "failed to append pane output: {err}");
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => break,
                }
            }
        });

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
        let writer = Arc::new(StdMutex::new(pair.master.take_writer()?));
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = writer.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    if let Ok(mut guard) = writer.lock() {
                        let _ = guard.write_all(&bytes);
                        let _ = guard.flush();
                    }
                })
                .await;
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        let wait_exited = exited.clone();
        let events = self.events.clone();
        let address = request.address.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            let exit_code = match status {
                Ok(Ok(status)) => Some(status.exit_code() as i32),
                _ => None,
            };
            // Let the reader drain the final output so the log is complete
            // before the exit is published.
            let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_handle).await;
            wait_exited.store(true, Ordering::SeqCst);
            debug!(pane = %address, pid, ?exit_code, "pane process exited");
            let _ = events.send(ProcessEvent::Exited {
                address,
                pid,
                exit_code,
            });
        });

        let previous = self.panes.lock().await.insert(
            request.address.clone(),
            PaneProcess::Spawned(SpawnedPane {
                pid,
                writer_tx,
                killer,
                exited,
                _master: pair.master,
            }),
        );
        if let Some(PaneProcess::Adopted(previous)) = previous {
            previous.cancel.cancel();
        }

        Ok(ProcessHandle {
            pid,
            started_at: Utc::now(),
        })
    }

    async fn write(&self, address: &PaneAddress, input: &ValidatedInput) -> anyhow::Result<()> {
        let writer_tx = {
            let panes = self.panes.lock().await;
            match panes.get(address) {
                Some(PaneProcess::Spawned(pane)) if !pane.exited.load(Ordering::SeqCst) => {
                    pane.writer_tx.clone()
                }
                Some(PaneProcess::Spawned(pane)) => {
                    return Err(anyhow!("process {} has exited", pane.pid));
                }
                Some(PaneProcess::Adopted(pane)) => {
                    return Err(anyhow!(
                        "input is not available for adopted process {}",
                        pane.pid
                    ));
                }
                None => return Err(anyhow!("no process is tracked for this pane")),
            }
        };
        writer_tx
            .send(input.as_bytes().to_vec())
            .await
            .map_err(|_| anyhow!("pane writer is closed"))
    }

    async fn signal(&self, address: &PaneAddress, signal: Signal) -> anyhow::Result<()> {
        let mut panes = self.panes.lock().await;
        match panes.get_mut(address) {
            Some(PaneProcess::Spawned(pane)) => match signal {
                Signal::Terminate => send_signal(pane.pid, Signal::Terminate)
                    .or_else(|_| pane.killer.kill().map_err(anyhow::Error::from)),
                Signal::Kill => pane.killer.kill().map_err(anyhow::Error::from),
            },
            Some(PaneProcess::Adopted(pane)) => send_signal(pane.pid, signal),
            None => Err(anyhow!("no process is tracked for this pane")),
        }
    }

    async fn is_running(&self, address: &PaneAddress) -> bool {
        self.panes
            .lock()
            .await
            .get(address)
            .is_some_and(PaneProcess::is_running)
    }

    async fn probe(&self, identity: &ProcessIdentity) -> Liveness {
        match probe_pid(identity.pid) {
            Liveness::Alive => verify_identity(identity),
            other => other,
        }
    }

    async fn adopt(&self, address: &PaneAddress, pid: u32) -> anyhow::Result<()> {
        if probe_pid(pid) == Liveness::Dead {
            return Err(anyhow!("process {pid} is not running"));
        }
        let exited = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let events = self.events.clone();
        let poll_exited = exited.clone();
        let poll_cancel = cancel.clone();
        let poll_address = address.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_cancel.cancelled() => break,
                    _ = tokio::time::sleep(ADOPTED_POLL_INTERVAL) => {
                        if probe_pid(pid) == Liveness::Dead {
                            poll_exited.store(true, Ordering::SeqCst);
                            let _ = events.send(ProcessEvent::Exited {
                                address: poll_address,
                                pid,
                                exit_code: None,
                            });
                            break;
                        }
                    }
                }
            }
        });
        self.panes.lock().await.insert(
            address.clone(),
            PaneProcess::Adopted(AdoptedPane {
                pid,
                exited,
                cancel,
            }),
        );
        Ok(())
    }

    /// Only adopted panes are released; a spawned pane keeps its pty.
    async fn release(&self, address: &PaneAddress) {
        let mut panes = self.panes.lock().await;
        if matches!(panes.get(address), Some(PaneProcess::Adopted(_)))
            && let Some(PaneProcess::Adopted(pane)) = panes.remove(address)
        {
            pane.cancel.cancel();
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> anyhow::Result<()> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = libc::pid_t::try_from(pid).context("pid out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) -> anyhow::Result<()> {
    Err(anyhow!("signals are not supported for process {pid} on this platform"))
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> Liveness {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Liveness::Dead;
    };
    if pid <= 0 {
        return Liveness::Dead;
    }
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) {
        Liveness::Alive
    } else {
        Liveness::Dead
    }
}

#[cfg(not(unix))]
fn probe_pid(_pid: u32) -> Liveness {
    Liveness::Dead
}

/// A pane process carries `PANEWATCH_PANE=<address>` in its environment and
/// started no later than the pane recorded. Anything else reusing the pid is
/// foreign.
#[cfg(target_os = "linux")]
fn verify_identity(identity: &ProcessIdentity) -> Liveness {
    let pid = identity.pid;
    let environ = match std::fs::read(format!("/proc/{pid}/environ")) {
        Ok(environ) => environ,
        Err(err) => {
            debug!(pid, "cannot read process environment: {err}");
            return Liveness::Foreign;
        }
    };
    let marker = format!("{PANE_ENV_VAR}={}", identity.address);
    if !environ
        .split(|byte| *byte == 0)
        .any(|entry| entry == marker.as_bytes())
    {
        debug!(pid, pane = %identity.address, "process does not belong to the pane");
        return Liveness::Foreign;
    }
    let latest = identity.started_at + chrono::Duration::seconds(START_TIME_SLACK_SECS);
    match process_start_time(pid) {
        Some(started) if started <= latest => Liveness::Alive,
        Some(started) => {
            debug!(pid, %started, "process started after the pane was recorded");
            Liveness::Foreign
        }
        None => Liveness::Foreign,
    }
}

/// Without procfs there is no way to tell the pane's process from a stranger
/// holding the same pid, so nothing is adopted.
#[cfg(not(target_os = "linux"))]
fn verify_identity(identity: &ProcessIdentity) -> Liveness {
    debug!(pid = identity.pid, "process identity cannot be verified on this platform");
    Liveness::Foreign
}

#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<chrono::DateTime<Utc>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; fields resume after its `)`.
    // `starttime` (field 22) is in clock ticks since boot.
    let fields = &stat[stat.rfind(')')? + 1..];
    let ticks: i64 = fields.split_whitespace().nth(19)?.parse().ok()?;
    let boot_secs: i64 = std::fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;
    // SAFETY: sysconf has no memory-safety preconditions.
    let ticks_per_sec = i64::from(unsafe { libc::sysconf(libc::_SC_CLK_TCK) });
    if ticks_per_sec <= 0 {
        return None;
    }
    let millis = boot_secs
        .checked_mul(1000)?
        .checked_add(ticks.checked_mul(1000)? / ticks_per_sec)?;
    chrono::DateTime::from_timestamp_millis(millis)
}
