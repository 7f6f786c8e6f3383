//! Durable session records and startup recovery.
//!
//! Each live session is stored as one JSON document. Records carry a format
//! version and a SHA-256 checksum of the topology they describe; anything
//! that fails either check is discarded at recovery rather than repaired.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::PaneAddress;
use crate::error::ErrorKind;
use crate::error::OrchestratorError;
use crate::error::StoreError;
use crate::exec::CommandExecutor;
use crate::exec::Liveness;
use crate::exec::ProcessIdentity;
use crate::registry::PaneOrigin;
use crate::registry::Session;
use crate::registry::SessionRegistry;
use crate::registry::TopologyEvent;

pub const RECORD_FORMAT_VERSION: u32 = 1;

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSessionRecord {
    pub version: u32,
    pub session: Session,
    pub uptime_secs: i64,
    pub pane_count: usize,
    pub saved_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized `session`.
    pub checksum: String,
}

impl PersistedSessionRecord {
    pub fn from_session(session: Session) -> Result<Self, StoreError> {
        let checksum = topology_checksum(&session)?;
        let saved_at = Utc::now();
        Ok(Self {
            version: RECORD_FORMAT_VERSION,
            uptime_secs: (saved_at - session.created_at).num_seconds().max(0),
            pane_count: session.pane_count(),
            saved_at,
            checksum,
            session,
        })
    }

    pub fn verify(&self) -> Result<(), String> {
        if self.version != RECORD_FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {} (expected {RECORD_FORMAT_VERSION})",
                self.version
            ));
        }
        let actual = topology_checksum(&self.session).map_err(|err| err.to_string())?;
        if actual != self.checksum {
            return Err("checksum mismatch".to_string());
        }
        if self.pane_count != self.session.pane_count() {
            return Err(format!(
                "pane count {} does not match topology ({})",
                self.pane_count,
                self.session.pane_count()
            ));
        }
        Ok(())
    }
}

fn topology_checksum(session: &Session) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(session).map_err(|source| StoreError::Encode {
        session: session.name.clone(),
        source,
    })?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// A record as found in the store; unreadable entries keep their location so
/// they can be discarded.
#[derive(Debug)]
pub struct StoredRecord {
    pub path: PathBuf,
    pub record: Result<PersistedSessionRecord, StoreError>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, record: &PersistedSessionRecord) -> Result<(), StoreError>;

    /// Removing a record that does not exist succeeds.
    async fn remove(&self, session: &str) -> Result<(), StoreError>;

    async fn discard(&self, path: &Path) -> Result<(), StoreError>;

    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError>;
}

/// One `<session>.json` file per session under a directory.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{session}.{RECORD_EXTENSION}"))
    }
}

fn write_record_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|err| StoreError::write(dir, err))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|err| StoreError::write(dir, err))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| StoreError::write(path, err))?;
    tmp.persist(path)
        .map_err(|err| StoreError::write(path, err.error))?;
    Ok(())
}

#[async_trait]
impl SessionStore for JsonDirStore {
    async fn save(&self, record: &PersistedSessionRecord) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(record).map_err(|source| StoreError::Encode {
                session: record.session.name.clone(),
                source,
            })?;
        let dir = self.dir.clone();
        let path = self.record_path(&record.session.name);
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_record_atomic(&dir, &target, &bytes))
            .await
            .map_err(|err| StoreError::write(&path, std::io::Error::other(err)))?
    }

    async fn remove(&self, session: &str) -> Result<(), StoreError> {
        self.discard(&self.record_path(session)).await
    }

    async fn discard(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::write(path, err)),
        }
    }

    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::read(&self.dir, err)),
        };
        let mut paths = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| StoreError::read(&self.dir, err))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let record = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<PersistedSessionRecord>(&bytes)
                    .map_err(|err| StoreError::corrupt(&path, err)),
                Err(err) => Err(StoreError::read(&path, err)),
            };
            records.push(StoredRecord { path, record });
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedRecord {
    /// Session name when the record could be read, otherwise the file path.
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub recovered: Vec<String>,
    pub discarded: Vec<DiscardedRecord>,
    /// Records left untouched because their session is already live.
    #[serde(default)]
    pub skipped: Vec<String>,
}

enum RecordOutcome {
    Recovered,
    /// The session is already live; its record belongs to it.
    Skipped,
    Discarded(String),
}

/// Keeps the store in step with the registry.
#[derive(Clone)]
pub struct PersistenceService {
    store: Arc<dyn SessionStore>,
    registry: Arc<SessionRegistry>,
    // Serializes saves against removals so a destroyed session's record is
    // never written back.
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for PersistenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceService").finish_non_exhaustive()
    }
}

impl PersistenceService {
    pub fn new(store: Arc<dyn SessionStore>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            store,
            registry,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Builds records for every live session without writing them.
    pub async fn snapshot(&self) -> Result<Vec<PersistedSessionRecord>, StoreError> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|session| session.alive)
            .map(PersistedSessionRecord::from_session)
            .collect()
    }

    /// Writes one record. Sessions no longer in the registry are skipped.
    pub async fn save_session(&self, name: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Ok(session) = self.registry.session(name).await else {
            return Ok(false);
        };
        let record = PersistedSessionRecord::from_session(session)?;
        self.store.save(&record).await?;
        debug!(session = name, panes = record.pane_count, "session record saved");
        Ok(true)
    }

    /// Writes every live session; returns how many records were written.
    pub async fn snapshot_all(&self) -> Result<usize, StoreError> {
        let names: Vec<String> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|session| session.name)
            .collect();
        let mut written = 0;
        for name in names {
            if self.save_session(&name).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(name).await
    }

    /// Restores every stored session whose panes are all still running.
    /// Anything else is discarded and removed from the store, except records
    /// of sessions that are already live, which are left alone.
    pub async fn recover(&self, executor: &CommandExecutor) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        for stored in self.store.load_all().await? {
            let (source, outcome) = match stored.record {
                Ok(record) => {
                    let name = record.session.name.clone();
                    (name, self.recover_record(record, executor).await)
                }
                Err(err) => (
                    stored.path.display().to_string(),
                    RecordOutcome::Discarded(err.to_string()),
                ),
            };
            match outcome {
                RecordOutcome::Recovered => {
                    info!(session = %source, "session recovered");
                    report.recovered.push(source);
                }
                RecordOutcome::Skipped => {
                    debug!(session = %source, "session already live; record kept");
                    report.skipped.push(source);
                }
                RecordOutcome::Discarded(reason) => {
                    let err = OrchestratorError::RecoveryDiscarded {
                        session: source.clone(),
                        reason: reason.clone(),
                    };
                    warn!(kind = %ErrorKind::RecoveryDiscarded, "{err}");
                    if let Err(err) = self.store.discard(&stored.path).await {
                        warn!("failed to remove discarded record: {err}");
                    }
                    report.discarded.push(DiscardedRecord { source, reason });
                }
            }
        }
        Ok(report)
    }

    async fn recover_record(
        &self,
        record: PersistedSessionRecord,
        executor: &CommandExecutor,
    ) -> RecordOutcome {
        if let Err(reason) = record.verify() {
            return RecordOutcome::Discarded(reason);
        }
        let mut session = record.session;
        if self.registry.contains_session(&session.name).await {
            return RecordOutcome::Skipped;
        }
        for pane in session.panes() {
            let identity = ProcessIdentity {
                address: pane.address.clone(),
                pid: pane.pid,
                started_at: pane.started_at,
            };
            match executor.probe(&identity).await {
                Liveness::Alive => {}
                Liveness::Dead => {
                    return RecordOutcome::Discarded(format!(
                        "pane {} (pid {}) is no longer running",
                        pane.address, pane.pid
                    ));
                }
                Liveness::Foreign => {
                    return RecordOutcome::Discarded(format!(
                        "pid {} of pane {} now belongs to another process",
                        pane.pid, pane.address
                    ));
                }
            }
        }

        // Adopt every pane before the session becomes visible, so a failure
        // part way only has backend state to undo.
        let mut adopted = Vec::new();
        for pane in session.panes() {
            if let Err(err) = executor.adopt(&pane.address, pane.pid).await {
                release_adopted(executor, &session.name, &adopted).await;
                return RecordOutcome::Discarded(err.to_string());
            }
            adopted.push(pane.address.clone());
        }

        session.alive = true;
        for window in session.windows.values_mut() {
            for pane in window.panes.values_mut() {
                pane.origin = PaneOrigin::Recovered;
            }
        }
        let name = session.name.clone();
        match self.registry.restore(session).await {
            Ok(()) => RecordOutcome::Recovered,
            Err(err) if err.kind() == ErrorKind::Duplicate => {
                release_adopted(executor, &name, &adopted).await;
                RecordOutcome::Skipped
            }
            Err(err) => {
                release_adopted(executor, &name, &adopted).await;
                RecordOutcome::Discarded(err.to_string())
            }
        }
    }
}

async fn release_adopted(executor: &CommandExecutor, session: &str, adopted: &[PaneAddress]) {
    for address in adopted {
        executor.release(address).await;
    }
    debug!(session, released = adopted.len(), "rolled back partial recovery");
}

/// Coalesces topology changes into debounced writes and rewrites every
/// session on a fixed interval. Destroyed sessions are left to the caller,
/// which removes their record synchronously.
pub fn spawn_persistence_task(
    service: PersistenceService,
    mut events: broadcast::Receiver<TopologyEvent>,
    debounce: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut dirty: BTreeSet<String> = BTreeSet::new();
        let mut periodic = tokio::time::interval(interval.max(Duration::from_millis(1)));
        periodic.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        periodic.tick().await;
        let flush_at = tokio::time::sleep(debounce);
        tokio::pin!(flush_at);
        let mut armed = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(TopologyEvent::SessionDestroyed { session }) => {
                        dirty.remove(&session);
                    }
                    Ok(event) => {
                        dirty.insert(event.session().to_string());
                        if !armed {
                            flush_at.as_mut().reset(tokio::time::Instant::now() + debounce);
                            armed = true;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "persistence lagged; rewriting all sessions");
                        write_all(&service).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = &mut flush_at, if armed => {
                    armed = false;
                    for name in std::mem::take(&mut dirty) {
                        if let Err(err) = service.save_session(&name).await {
                            warn!(kind = %ErrorKind::Storage, session = %name, "{err}");
                        }
                    }
                }
                _ = periodic.tick() => write_all(&service).await,
            }
        }

        for name in dirty {
            if let Err(err) = service.save_session(&name).await {
                warn!(kind = %ErrorKind::Storage, session = %name, "{err}");
            }
        }
        debug!("persistence task stopped");
    })
}

async fn write_all(service: &PersistenceService) {
    if let Err(err) = service.snapshot_all().await {
        warn!(kind = %ErrorKind::Storage, "periodic snapshot failed: {err}");
    }
}
