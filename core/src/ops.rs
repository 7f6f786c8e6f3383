//! Closed set of caller-facing operations and their JSON results.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::address::PaneAddress;
use crate::address::WindowAddress;
use crate::classifier::PatternSpec;
use crate::classifier::Severity;
use crate::coordinator::TriggerRule;
use crate::error::ErrorPayload;
use crate::error::Result;
use crate::orchestrator::Orchestrator;

fn default_recent_limit() -> usize {
    20
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateSession {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default)]
        windows: Vec<String>,
    },
    CreateWindow {
        window: WindowAddress,
    },
    RemoveWindow {
        window: WindowAddress,
    },
    CreatePane {
        window: WindowAddress,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    RemovePane {
        pane: PaneAddress,
    },
    SelectPane {
        pane: PaneAddress,
    },
    ExecuteCommand {
        pane: PaneAddress,
        command: String,
    },
    SendInput {
        pane: PaneAddress,
        input: String,
    },
    DestroySession {
        name: String,
    },
    ListSessions,
    ResolvePane {
        pane: PaneAddress,
    },
    ErrorsWatch {
        pane: PaneAddress,
        #[serde(default)]
        languages: Vec<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    ErrorsUnwatch {
        pane: PaneAddress,
    },
    ErrorsAddPattern {
        pattern: PatternSpec,
    },
    ErrorsRemovePattern {
        name: String,
    },
    ErrorsListPatterns,
    ErrorsSummary {
        pane: PaneAddress,
        #[serde(default)]
        min_severity: Option<Severity>,
        #[serde(default)]
        limit: Option<usize>,
    },
    ErrorsAnalyze {
        pane: PaneAddress,
    },
    AddTriggerRule {
        rule: TriggerRule,
    },
    RemoveTriggerRule {
        id: String,
    },
    ListTriggerRules,
    RecentTriggers {
        #[serde(default = "default_recent_limit")]
        limit: usize,
    },
    MonitorPort {
        pane: PaneAddress,
        port: u16,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    SnapshotAll,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateSession { .. } => "create_session",
            Operation::CreateWindow { .. } => "create_window",
            Operation::RemoveWindow { .. } => "remove_window",
            Operation::CreatePane { .. } => "create_pane",
            Operation::RemovePane { .. } => "remove_pane",
            Operation::SelectPane { .. } => "select_pane",
            Operation::ExecuteCommand { .. } => "execute_command",
            Operation::SendInput { .. } => "send_input",
            Operation::DestroySession { .. } => "destroy_session",
            Operation::ListSessions => "list_sessions",
            Operation::ResolvePane { .. } => "resolve_pane",
            Operation::ErrorsWatch { .. } => "errors_watch",
            Operation::ErrorsUnwatch { .. } => "errors_unwatch",
            Operation::ErrorsAddPattern { .. } => "errors_add_pattern",
            Operation::ErrorsRemovePattern { .. } => "errors_remove_pattern",
            Operation::ErrorsListPatterns => "errors_list_patterns",
            Operation::ErrorsSummary { .. } => "errors_summary",
            Operation::ErrorsAnalyze { .. } => "errors_analyze",
            Operation::AddTriggerRule { .. } => "add_trigger_rule",
            Operation::RemoveTriggerRule { .. } => "remove_trigger_rule",
            Operation::ListTriggerRules => "list_trigger_rules",
            Operation::RecentTriggers { .. } => "recent_triggers",
            Operation::MonitorPort { .. } => "monitor_port",
            Operation::SnapshotAll => "snapshot_all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationResponse {
    Ok { result: Value },
    Error { error: ErrorPayload },
}

impl OperationResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, OperationResponse::Ok { .. })
    }
}

/// Runs one operation; failures come back as a `{kind, detail}` payload.
pub async fn dispatch(orchestrator: &Orchestrator, operation: Operation) -> OperationResponse {
    let name = operation.name();
    match execute(orchestrator, operation).await {
        Ok(result) => OperationResponse::Ok { result },
        Err(err) => {
            debug!(op = name, kind = %err.kind(), "operation failed: {err}");
            OperationResponse::Error {
                error: ErrorPayload::from(&err),
            }
        }
    }
}

async fn execute(orchestrator: &Orchestrator, operation: Operation) -> Result<Value> {
    let value = match operation {
        Operation::CreateSession {
            name,
            working_dir,
            windows,
        } => serde_json::to_value(
            orchestrator
                .create_session(name, working_dir, windows)
                .await?,
        )?,
        Operation::CreateWindow { window } => {
            serde_json::to_value(orchestrator.create_window(&window).await?)?
        }
        Operation::RemoveWindow { window } => {
            serde_json::to_value(orchestrator.remove_window(&window).await?)?
        }
        Operation::CreatePane {
            window,
            command,
            env,
        } => serde_json::to_value(
            orchestrator
                .create_pane(&window, command.as_deref(), env)
                .await?,
        )?,
        Operation::RemovePane { pane } => {
            serde_json::to_value(orchestrator.remove_pane(&pane).await?)?
        }
        Operation::SelectPane { pane } => {
            orchestrator.select_pane(&pane).await?;
            json!({ "active": pane })
        }
        Operation::ExecuteCommand { pane, command } => {
            serde_json::to_value(orchestrator.execute_command(&pane, &command).await?)?
        }
        Operation::SendInput { pane, input } => {
            orchestrator.send_input(&pane, input.as_bytes()).await?;
            json!({ "pane": pane, "bytes": input.len() })
        }
        Operation::DestroySession { name } => {
            serde_json::to_value(orchestrator.destroy_session(&name).await?)?
        }
        Operation::ListSessions => serde_json::to_value(orchestrator.list_sessions().await)?,
        Operation::ResolvePane { pane } => {
            serde_json::to_value(orchestrator.resolve_pane(&pane).await?)?
        }
        Operation::ErrorsWatch {
            pane,
            languages,
            duration_ms,
        } => serde_json::to_value(
            orchestrator
                .errors_watch(&pane, languages, duration_ms.map(Duration::from_millis))
                .await?,
        )?,
        Operation::ErrorsUnwatch { pane } => {
            serde_json::to_value(orchestrator.errors_unwatch(&pane).await?)?
        }
        Operation::ErrorsAddPattern { pattern } => {
            let name = pattern.name.clone();
            let change = orchestrator.errors_add_pattern(pattern)?;
            json!({ "name": name, "change": change })
        }
        Operation::ErrorsRemovePattern { name } => {
            let removed = orchestrator.errors_remove_pattern(&name);
            json!({ "name": name, "removed": removed })
        }
        Operation::ErrorsListPatterns => serde_json::to_value(orchestrator.errors_list_patterns())?,
        Operation::ErrorsSummary {
            pane,
            min_severity,
            limit,
        } => serde_json::to_value(
            orchestrator
                .errors_summary(&pane, min_severity, limit)
                .await?,
        )?,
        Operation::ErrorsAnalyze { pane } => {
            serde_json::to_value(orchestrator.errors_analyze(&pane).await?)?
        }
        Operation::AddTriggerRule { rule } => {
            let id = rule.id.clone();
            orchestrator.add_trigger_rule(rule).await?;
            json!({ "id": id })
        }
        Operation::RemoveTriggerRule { id } => {
            serde_json::to_value(orchestrator.remove_trigger_rule(&id).await?)?
        }
        Operation::ListTriggerRules => {
            serde_json::to_value(orchestrator.list_trigger_rules().await?)?
        }
        Operation::RecentTriggers { limit } => {
            serde_json::to_value(orchestrator.recent_triggers(limit).await?)?
        }
        Operation::MonitorPort {
            pane,
            port,
            interval_ms,
        } => {
            orchestrator
                .monitor_port(&pane, port, interval_ms.map(Duration::from_millis))
                .await?;
            json!({ "pane": pane, "port": port })
        }
        Operation::SnapshotAll => json!({ "written": orchestrator.snapshot_all().await? }),
    };
    Ok(value)
}
