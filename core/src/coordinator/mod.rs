//! Trigger coordination.
//!
//! One task owns the [`TriggerEngine`]. Classified entries and lifecycle
//! events arrive over channels, rule changes arrive as control messages, and
//! fired triggers are handed to sinks without blocking evaluation.

mod engine;
mod sinks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::PaneAddress;
use crate::classifier::ErrorEntry;
use crate::classifier::RingBuffer;
use crate::error::ErrorKind;
use crate::error::OrchestratorError;
use crate::error::Result;

pub use engine::LifecycleEvent;
pub use engine::LifecycleKind;
pub use engine::RuleStatus;
pub use engine::TriggerCondition;
pub use engine::TriggerEngine;
pub use engine::TriggerEvent;
pub use engine::TriggerRule;
pub use sinks::ChannelSink;
pub use sinks::JsonLinesSink;
pub use sinks::LineWriter;
pub use sinks::SinkError;
pub use sinks::TracingSink;
pub use sinks::TriggerSink;

const CONTROL_CHANNEL_CAPACITY: usize = 64;
const RECENT_TRIGGERS: usize = 100;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub counter_window: Duration,
    pub default_debounce: Duration,
    pub sink_timeout: Duration,
    pub entry_channel_capacity: usize,
}

enum Control {
    AddRule {
        rule: TriggerRule,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveRule {
        id: String,
        reply: oneshot::Sender<Result<TriggerRule>>,
    },
    ListRules {
        reply: oneshot::Sender<Vec<RuleStatus>>,
    },
    RecentTriggers {
        limit: usize,
        reply: oneshot::Sender<Vec<TriggerEvent>>,
    },
    RegisterSink {
        sink: Arc<dyn TriggerSink>,
    },
    ListSinks {
        reply: oneshot::Sender<Vec<String>>,
    },
    ForgetPane {
        pane: PaneAddress,
    },
    ForgetSession {
        session: String,
    },
    Lifecycle(LifecycleEvent),
}

/// Cloneable front door to the coordinator task.
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    control: mpsc::Sender<Control>,
    entries: mpsc::Sender<ErrorEntry>,
}

impl CoordinatorHandle {
    /// Sender that classifier tasks forward their entries into.
    pub fn entries(&self) -> mpsc::Sender<ErrorEntry> {
        self.entries.clone()
    }

    pub async fn add_rule(&self, rule: TriggerRule) -> Result<()> {
        self.request(|reply| Control::AddRule { rule, reply }).await?
    }

    pub async fn remove_rule(&self, id: &str) -> Result<TriggerRule> {
        let id = id.to_string();
        self.request(|reply| Control::RemoveRule { id, reply })
            .await?
    }

    pub async fn list_rules(&self) -> Result<Vec<RuleStatus>> {
        self.request(|reply| Control::ListRules { reply }).await
    }

    /// Most recently fired triggers, oldest first.
    pub async fn recent_triggers(&self, limit: usize) -> Result<Vec<TriggerEvent>> {
        self.request(|reply| Control::RecentTriggers { limit, reply })
            .await
    }

    pub async fn list_sinks(&self) -> Result<Vec<String>> {
        self.request(|reply| Control::ListSinks { reply }).await
    }

    /// Registers a sink, replacing any sink with the same id.
    pub async fn register_sink(&self, sink: Arc<dyn TriggerSink>) -> Result<()> {
        self.send(Control::RegisterSink { sink }).await
    }

    pub async fn forget_pane(&self, pane: &PaneAddress) -> Result<()> {
        self.send(Control::ForgetPane { pane: pane.clone() })
            .await
    }

    pub async fn forget_session(&self, session: &str) -> Result<()> {
        self.send(Control::ForgetSession {
            session: session.to_string(),
        })
        .await
    }

    pub async fn lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        self.send(Control::Lifecycle(event)).await
    }

    async fn send(&self, message: Control) -> Result<()> {
        self.control
            .send(message)
            .await
            .map_err(|_| OrchestratorError::ShuttingDown)
    }

    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Control,
    {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| OrchestratorError::ShuttingDown)
    }
}

/// Spawns the coordinator task. It runs until `cancel` fires, then drains
/// queued entries and waits for in-flight deliveries.
pub fn spawn_coordinator(
    config: CoordinatorConfig,
    sinks: Vec<Arc<dyn TriggerSink>>,
    cancel: CancellationToken,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let (entries_tx, entries_rx) = mpsc::channel(config.entry_channel_capacity.max(1));
    let coordinator = Coordinator {
        engine: TriggerEngine::new(config.counter_window, config.default_debounce),
        sinks: sinks
            .into_iter()
            .map(|sink| (sink.id().to_string(), sink))
            .collect(),
        recent: RingBuffer::new(RECENT_TRIGGERS),
        deliveries: JoinSet::new(),
        sink_timeout: config.sink_timeout,
    };
    let task = tokio::spawn(coordinator.run(control_rx, entries_rx, cancel));
    (
        CoordinatorHandle {
            control: control_tx,
            entries: entries_tx,
        },
        task,
    )
}

struct Coordinator {
    engine: TriggerEngine,
    sinks: HashMap<String, Arc<dyn TriggerSink>>,
    recent: RingBuffer<TriggerEvent>,
    deliveries: JoinSet<()>,
    sink_timeout: Duration,
}

impl Coordinator {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<Control>,
        mut entries: mpsc::Receiver<ErrorEntry>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(message) = control.recv() => self.handle_control(message),
                Some(entry) = entries.recv() => {
                    let fired = self.engine.observe_entry(&entry, Instant::now());
                    self.dispatch(fired);
                }
                Some(_) = self.deliveries.join_next(), if !self.deliveries.is_empty() => {}
                else => break,
            }
        }

        entries.close();
        while let Some(entry) = entries.recv().await {
            let fired = self.engine.observe_entry(&entry, Instant::now());
            self.dispatch(fired);
        }
        while self.deliveries.join_next().await.is_some() {}
        debug!("trigger coordinator stopped");
    }

    fn handle_control(&mut self, message: Control) {
        match message {
            Control::AddRule { rule, reply } => {
                let result = if self.sinks.contains_key(&rule.sink) {
                    let id = rule.id.clone();
                    self.engine.add_rule(rule).inspect(|()| {
                        info!(rule = %id, "trigger rule added");
                    })
                } else {
                    Err(OrchestratorError::SinkNotFound { id: rule.sink })
                };
                let _ = reply.send(result);
            }
            Control::RemoveRule { id, reply } => {
                let _ = reply.send(self.engine.remove_rule(&id));
            }
            Control::ListRules { reply } => {
                let _ = reply.send(self.engine.rules());
            }
            Control::RecentTriggers { limit, reply } => {
                let _ = reply.send(self.recent.recent(limit));
            }
            Control::RegisterSink { sink } => {
                debug!(sink = sink.id(), "sink registered");
                self.sinks.insert(sink.id().to_string(), sink);
            }
            Control::ListSinks { reply } => {
                let mut ids: Vec<String> = self.sinks.keys().cloned().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
            Control::ForgetPane { pane } => self.engine.forget_pane(&pane),
            Control::ForgetSession { session } => self.engine.forget_session(&session),
            Control::Lifecycle(event) => {
                let fired = self.engine.observe_lifecycle(&event, Instant::now());
                self.dispatch(fired);
            }
        }
    }

    fn dispatch(&mut self, fired: Vec<TriggerEvent>) {
        for event in fired {
            info!(
                rule = %event.rule_id,
                sink = %event.sink_id,
                pane = %event.pane,
                reason = %event.reason,
                "trigger fired"
            );
            self.recent.push(event.clone());
            let Some(sink) = self.sinks.get(&event.sink_id).cloned() else {
                report_unavailable(&event.sink_id, "sink is no longer registered");
                continue;
            };
            let timeout = self.sink_timeout;
            self.deliveries.spawn(async move {
                match tokio::time::timeout(timeout, sink.deliver(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => report_unavailable(&event.sink_id, &err.to_string()),
                    Err(_) => report_unavailable(
                        &event.sink_id,
                        &format!("delivery exceeded {timeout:?}"),
                    ),
                }
            });
        }
    }
}

fn report_unavailable(id: &str, reason: &str) {
    let err = OrchestratorError::SinkUnavailable {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    warn!(kind = %ErrorKind::SinkUnavailable, "{err}");
}
