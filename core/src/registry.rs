use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::address::PaneAddress;
use crate::address::WindowAddress;
use crate::address::validate_name;
use crate::error::OrchestratorError;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub alive: bool,
    pub working_dir: PathBuf,
    pub windows: IndexMap<String, Window>,
    /// Next pane index of removed windows, so a re-added window continues
    /// numbering instead of reusing addresses.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retired_indices: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub name: String,
    pub panes: IndexMap<u32, Pane>,
    pub active_pane: Option<u32>,
    pub next_pane_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneOrigin {
    Spawned,
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pane {
    pub address: PaneAddress,
    pub command: Option<String>,
    pub pid: u32,
    pub log_path: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Start of the pane's current process; moves forward on respawn.
    pub started_at: DateTime<Utc>,
    pub origin: PaneOrigin,
}

impl Session {
    pub fn panes(&self) -> impl Iterator<Item = &Pane> {
        self.windows.values().flat_map(|window| window.panes.values())
    }

    pub fn pane_count(&self) -> usize {
        self.windows.values().map(|window| window.panes.len()).sum()
    }
}

impl Window {
    fn new(name: &str, next_pane_index: u32) -> Self {
        Self {
            name: name.to_string(),
            panes: IndexMap::new(),
            active_pane: None,
            next_pane_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    SessionCreated { session: String },
    SessionRestored { session: String },
    SessionDestroyed { session: String },
    WindowAdded { window: WindowAddress },
    WindowRemoved { window: WindowAddress },
    PaneAdded { pane: PaneAddress },
    PaneUpdated { pane: PaneAddress },
    PaneRemoved { pane: PaneAddress },
}

impl TopologyEvent {
    pub fn session(&self) -> &str {
        match self {
            TopologyEvent::SessionCreated { session }
            | TopologyEvent::SessionRestored { session }
            | TopologyEvent::SessionDestroyed { session } => session,
            TopologyEvent::WindowAdded { window } | TopologyEvent::WindowRemoved { window } => {
                window.session()
            }
            TopologyEvent::PaneAdded { pane }
            | TopologyEvent::PaneUpdated { pane }
            | TopologyEvent::PaneRemoved { pane } => pane.session(),
        }
    }
}

/// Authoritative in-memory topology. Mutations take the write lock and
/// publish a [`TopologyEvent`]; lookups take the read lock.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<IndexMap<String, Session>>,
    events: broadcast::Sender<TopologyEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: RwLock::new(IndexMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TopologyEvent) {
        debug!(?event, "topology changed");
        let _ = self.events.send(event);
    }

    pub async fn create_session(
        &self,
        name: &str,
        working_dir: PathBuf,
        windows: &[String],
    ) -> Result<Session> {
        validate_name("session", name)?;
        let mut ordered = IndexMap::new();
        for window in windows {
            validate_name("window", window)?;
            if ordered.contains_key(window) {
                return Err(OrchestratorError::DuplicateWindow {
                    address: format!("{name}:{window}"),
                });
            }
            ordered.insert(window.clone(), Window::new(window, 0));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(name) {
            return Err(OrchestratorError::DuplicateSession {
                name: name.to_string(),
            });
        }
        let session = Session {
            name: name.to_string(),
            created_at: Utc::now(),
            alive: true,
            working_dir,
            windows: ordered,
            retired_indices: BTreeMap::new(),
        };
        sessions.insert(name.to_string(), session.clone());
        drop(sessions);

        self.emit(TopologyEvent::SessionCreated {
            session: name.to_string(),
        });
        Ok(session)
    }

    /// Reinstates a session reconstructed from durable state.
    pub async fn restore(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.name) {
            return Err(OrchestratorError::DuplicateSession { name: session.name });
        }
        let name = session.name.clone();
        sessions.insert(name.clone(), session);
        drop(sessions);
        self.emit(TopologyEvent::SessionRestored { session: name });
        Ok(())
    }

    pub async fn add_window(&self, address: &WindowAddress) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(address.session())
            .ok_or_else(|| OrchestratorError::session_not_found(address.session()))?;
        if session.windows.contains_key(address.window()) {
            return Err(OrchestratorError::DuplicateWindow {
                address: address.to_string(),
            });
        }
        let next_pane_index = session
            .retired_indices
            .remove(address.window())
            .unwrap_or_default();
        session.windows.insert(
            address.window().to_string(),
            Window::new(address.window(), next_pane_index),
        );
        drop(sessions);
        self.emit(TopologyEvent::WindowAdded {
            window: address.clone(),
        });
        Ok(())
    }

    pub async fn remove_window(&self, address: &WindowAddress) -> Result<Window> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(address.session())
            .ok_or_else(|| OrchestratorError::window_not_found(address))?;
        let window = session
            .windows
            .shift_remove(address.window())
            .ok_or_else(|| OrchestratorError::window_not_found(address))?;
        session
            .retired_indices
            .insert(window.name.clone(), window.next_pane_index);
        drop(sessions);
        self.emit(TopologyEvent::WindowRemoved {
            window: address.clone(),
        });
        Ok(window)
    }

    /// Claims the next pane index of a window. Indices only move forward, so
    /// an address is never handed out twice while the session lives.
    pub async fn reserve_pane(&self, address: &WindowAddress) -> Result<PaneAddress> {
        let mut sessions = self.sessions.write().await;
        let window = sessions
            .get_mut(address.session())
            .and_then(|session| session.windows.get_mut(address.window()))
            .ok_or_else(|| OrchestratorError::window_not_found(address))?;
        let index = window.next_pane_index;
        window.next_pane_index = index.saturating_add(1);
        Ok(address.pane(index))
    }

    pub async fn insert_pane(&self, pane: Pane) -> Result<()> {
        let address = pane.address.clone();
        let mut sessions = self.sessions.write().await;
        let window = sessions
            .get_mut(address.session())
            .and_then(|session| session.windows.get_mut(address.window()))
            .ok_or_else(|| OrchestratorError::window_not_found(address.window_address()))?;
        window.next_pane_index = window.next_pane_index.max(address.index().saturating_add(1));
        if window.active_pane.is_none() {
            window.active_pane = Some(address.index());
        }
        window.panes.insert(address.index(), pane);
        drop(sessions);
        self.emit(TopologyEvent::PaneAdded { pane: address });
        Ok(())
    }

    pub async fn update_pane<F>(&self, address: &PaneAddress, update: F) -> Result<Pane>
    where
        F: FnOnce(&mut Pane),
    {
        let mut sessions = self.sessions.write().await;
        let pane = sessions
            .get_mut(address.session())
            .and_then(|session| session.windows.get_mut(address.window()))
            .and_then(|window| window.panes.get_mut(&address.index()))
            .ok_or_else(|| OrchestratorError::pane_not_found(address))?;
        update(pane);
        let updated = pane.clone();
        drop(sessions);
        self.emit(TopologyEvent::PaneUpdated {
            pane: address.clone(),
        });
        Ok(updated)
    }

    pub async fn remove_pane(&self, address: &PaneAddress) -> Result<Pane> {
        let mut sessions = self.sessions.write().await;
        let window = sessions
            .get_mut(address.session())
            .and_then(|session| session.windows.get_mut(address.window()))
            .ok_or_else(|| OrchestratorError::pane_not_found(address))?;
        let pane = window
            .panes
            .shift_remove(&address.index())
            .ok_or_else(|| OrchestratorError::pane_not_found(address))?;
        if window.active_pane == Some(address.index()) {
            window.active_pane = window.panes.keys().next_back().copied();
        }
        drop(sessions);
        self.emit(TopologyEvent::PaneRemoved {
            pane: address.clone(),
        });
        Ok(pane)
    }

    pub async fn select_pane(&self, address: &PaneAddress) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let window = sessions
            .get_mut(address.session())
            .and_then(|session| session.windows.get_mut(address.window()))
            .filter(|window| window.panes.contains_key(&address.index()))
            .ok_or_else(|| OrchestratorError::pane_not_found(address))?;
        window.active_pane = Some(address.index());
        drop(sessions);
        self.emit(TopologyEvent::PaneUpdated {
            pane: address.clone(),
        });
        Ok(())
    }

    /// Removes the session and returns its final state with `alive` cleared.
    /// A second call for the same name reports `SessionNotFound`.
    pub async fn destroy_session(&self, name: &str) -> Result<Session> {
        let mut session = self
            .sessions
            .write()
            .await
            .shift_remove(name)
            .ok_or_else(|| OrchestratorError::session_not_found(name))?;
        session.alive = false;
        self.emit(TopologyEvent::SessionDestroyed {
            session: name.to_string(),
        });
        Ok(session)
    }

    pub async fn resolve(&self, address: &PaneAddress) -> Result<Pane> {
        self.sessions
            .read()
            .await
            .get(address.session())
            .filter(|session| session.alive)
            .and_then(|session| session.windows.get(address.window()))
            .and_then(|window| window.panes.get(&address.index()))
            .cloned()
            .ok_or_else(|| OrchestratorError::pane_not_found(address))
    }

    pub async fn contains_window(&self, address: &WindowAddress) -> bool {
        self.sessions
            .read()
            .await
            .get(address.session())
            .is_some_and(|session| session.windows.contains_key(address.window()))
    }

    pub async fn session(&self, name: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::session_not_found(name))
    }

    pub async fn contains_session(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }
}
