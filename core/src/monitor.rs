//! Port liveness monitoring for panes that serve on a TCP port.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::address::PaneAddress;
use crate::coordinator::CoordinatorHandle;
use crate::coordinator::LifecycleEvent;
use crate::coordinator::LifecycleKind;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Unknown,
    Open,
    Closed,
}

pub async fn probe_port(port: u16) -> PortState {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => PortState::Open,
        _ => PortState::Closed,
    }
}

/// Probes `port` every `interval` until `cancel` fires. Only an open to closed
/// transition is reported; a port that was never seen open stays silent.
pub fn spawn_port_monitor(
    pane: PaneAddress,
    port: u16,
    interval: Duration,
    coordinator: CoordinatorHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = PortState::Unknown;
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let next = probe_port(port).await;
            if state == PortState::Open && next == PortState::Closed {
                info!(pane = %pane, port, "monitored port closed");
                let event = LifecycleEvent {
                    pane: pane.clone(),
                    kind: LifecycleKind::PortClosed { port },
                    at: Utc::now(),
                };
                if coordinator.lifecycle(event).await.is_err() {
                    break;
                }
            } else if state != next {
                debug!(pane = %pane, port, ?next, "port state changed");
            }
            state = next;
        }
        debug!(pane = %pane, port, "port monitor stopped");
    })
}
