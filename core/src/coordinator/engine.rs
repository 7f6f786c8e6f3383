use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use crate::address::PaneAddress;
use crate::classifier::ErrorEntry;
use crate::classifier::Severity;
use crate::error::OrchestratorError;
use crate::error::Result;

fn default_min_severity() -> Severity {
    Severity::Error
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// `count` matching entries inside the sliding window.
    Threshold {
        count: u32,
        #[serde(default = "default_min_severity")]
        min_severity: Severity,
        /// Falls back to the configured counter window.
        #[serde(default)]
        window_ms: Option<u64>,
        #[serde(default)]
        pattern: Option<String>,
    },
    /// Every entry of `pattern` is its own edge.
    Occurrence { pattern: String },
    ProcessExited,
    PortClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub id: String,
    pub sink: String,
    pub condition: TriggerCondition,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    /// Restricts the rule to one pane.
    #[serde(default)]
    pub pane: Option<PaneAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleKind {
    ProcessExited { pid: u32, exit_code: Option<i32> },
    PortClosed { port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub pane: PaneAddress,
    #[serde(flatten)]
    pub kind: LifecycleKind,
    pub at: DateTime<Utc>,
}

/// Outbound trigger, delivered at most once per edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub sink_id: String,
    pub rule_id: String,
    #[serde(rename = "paneAddr")]
    pub pane: PaneAddress,
    pub reason: String,
    pub context: serde_json::Value,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStatus {
    pub rule: TriggerRule,
    pub fire_count: u64,
    pub last_fired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct RuleState {
    satisfied: bool,
    last_fired: Option<Instant>,
    /// Arrival times of the entries a threshold rule counts, oldest first.
    hits: VecDeque<Instant>,
}

impl RuleState {
    fn expire(&mut self, now: Instant, window: Duration) {
        while self
            .hits
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            self.hits.pop_front();
        }
    }
}

/// A threshold rule resolved against one incoming entry.
struct ThresholdCheck {
    id: String,
    count: usize,
    window: Duration,
    counts_entry: bool,
}

#[derive(Debug, Default)]
struct RuleStats {
    fire_count: u64,
    last_fired_at: Option<DateTime<Utc>>,
}

type StateKey = (String, PaneAddress);

/// Threshold and debounce evaluation. Pure state machine; callers supply the
/// clock so behaviour is deterministic. Each threshold rule keeps its own
/// sliding window per pane, so an entry costs one push plus expiry.
#[derive(Debug)]
pub struct TriggerEngine {
    rules: IndexMap<String, TriggerRule>,
    stats: HashMap<String, RuleStats>,
    states: HashMap<StateKey, RuleState>,
    default_window: Duration,
    default_debounce: Duration,
}

impl TriggerEngine {
    pub fn new(default_window: Duration, default_debounce: Duration) -> Self {
        Self {
            rules: IndexMap::new(),
            stats: HashMap::new(),
            states: HashMap::new(),
            default_window,
            default_debounce,
        }
    }

    pub fn add_rule(&mut self, rule: TriggerRule) -> Result<()> {
        if self.rules.contains_key(&rule.id) {
            return Err(OrchestratorError::DuplicateRule { id: rule.id });
        }
        match &rule.condition {
            TriggerCondition::Threshold { count: 0, .. } => {
                return Err(OrchestratorError::InvalidRule {
                    id: rule.id,
                    reason: "threshold count must be at least 1".to_string(),
                });
            }
            TriggerCondition::Occurrence { pattern } if pattern.is_empty() => {
                return Err(OrchestratorError::InvalidRule {
                    id: rule.id,
                    reason: "occurrence rules need a pattern name".to_string(),
                });
            }
            _ => {}
        }
        self.stats.insert(rule.id.clone(), RuleStats::default());
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&mut self, id: &str) -> Result<TriggerRule> {
        let rule = self
            .rules
            .shift_remove(id)
            .ok_or_else(|| OrchestratorError::RuleNotFound { id: id.to_string() })?;
        self.stats.remove(id);
        self.states.retain(|(rule_id, _), _| rule_id != id);
        Ok(rule)
    }

    pub fn rules(&self) -> Vec<RuleStatus> {
        self.rules
            .values()
            .map(|rule| {
                let stats = self.stats.get(&rule.id);
                RuleStatus {
                    rule: rule.clone(),
                    fire_count: stats.map(|s| s.fire_count).unwrap_or_default(),
                    last_fired_at: stats.and_then(|s| s.last_fired_at),
                }
            })
            .collect()
    }

    pub fn has_rule(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Drops all counters and edge state for a pane.
    pub fn forget_pane(&mut self, pane: &PaneAddress) {
        self.states.retain(|(_, p), _| p != pane);
    }

    pub fn forget_session(&mut self, session: &str) {
        self.states.retain(|(_, p), _| p.session() != session);
    }

    pub fn observe_entry(&mut self, entry: &ErrorEntry, now: Instant) -> Vec<TriggerEvent> {
        let pane = &entry.pane;
        let checks: Vec<ThresholdCheck> = self
            .rules
            .values()
            .filter(|rule| applies_to(rule, pane))
            .filter_map(|rule| match &rule.condition {
                TriggerCondition::Threshold {
                    count,
                    min_severity,
                    window_ms,
                    pattern,
                } => Some(ThresholdCheck {
                    id: rule.id.clone(),
                    count: *count as usize,
                    window: self.rule_window(*window_ms),
                    counts_entry: entry.severity >= *min_severity
                        && pattern.as_ref().is_none_or(|name| *name == entry.pattern),
                }),
                _ => None,
            })
            .collect();

        let mut fired = Vec::new();
        for check in checks {
            let state = self.state(&check.id, pane);
            // A condition that lapsed while no entries arrived re-arms before
            // the new entry is counted.
            state.expire(now, check.window);
            if state.hits.len() < check.count {
                state.satisfied = false;
            }
            if !check.counts_entry {
                continue;
            }
            state.hits.push_back(now);
            let current = state.hits.len();
            let met = current >= check.count;
            let edge = met && !state.satisfied;
            state.satisfied = met;
            if edge && let Some(event) = self.fire(&check.id, pane, now, || {
                entry_context(entry, Some(current))
            }) {
                fired.push(event);
            }
        }

        let occurrence_ids: Vec<String> = self
            .rules
            .values()
            .filter(|rule| applies_to(rule, pane))
            .filter(|rule| {
                matches!(&rule.condition, TriggerCondition::Occurrence { pattern } if *pattern == entry.pattern)
            })
            .map(|rule| rule.id.clone())
            .collect();
        for id in occurrence_ids {
            if let Some(event) = self.fire(&id, pane, now, || entry_context(entry, None)) {
                fired.push(event);
            }
        }
        fired
    }

    /// Lifecycle events fire their rules directly; they never touch counters.
    pub fn observe_lifecycle(&mut self, event: &LifecycleEvent, now: Instant) -> Vec<TriggerEvent> {
        let ids: Vec<String> = self
            .rules
            .values()
            .filter(|rule| applies_to(rule, &event.pane))
            .filter(|rule| {
                matches!(
                    (&rule.condition, &event.kind),
                    (
                        TriggerCondition::ProcessExited,
                        LifecycleKind::ProcessExited { .. }
                    ) | (TriggerCondition::PortClosed, LifecycleKind::PortClosed { .. })
                )
            })
            .map(|rule| rule.id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                self.fire(&id, &event.pane, now, || {
                    serde_json::to_value(&event.kind).unwrap_or_default()
                })
            })
            .collect()
    }

    fn fire<F>(&mut self, id: &str, pane: &PaneAddress, now: Instant, context: F) -> Option<TriggerEvent>
    where
        F: FnOnce() -> serde_json::Value,
    {
        let rule = self.rules.get(id)?.clone();
        let debounce = rule
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_debounce);
        let state = self.state(id, pane);
        if let Some(last) = state.last_fired
            && now.saturating_duration_since(last) < debounce
        {
            return None;
        }
        state.last_fired = Some(now);

        let fired_at = Utc::now();
        let stats = self.stats.entry(rule.id.clone()).or_default();
        stats.fire_count += 1;
        stats.last_fired_at = Some(fired_at);

        Some(TriggerEvent {
            sink_id: rule.sink.clone(),
            rule_id: rule.id.clone(),
            pane: pane.clone(),
            reason: self.describe(&rule),
            context: context(),
            fired_at,
        })
    }

    fn describe(&self, rule: &TriggerRule) -> String {
        match &rule.condition {
            TriggerCondition::Threshold {
                count,
                min_severity,
                window_ms,
                pattern,
            } => {
                let window = self.rule_window(*window_ms);
                let subject = match pattern {
                    Some(pattern) => format!("`{pattern}` entries"),
                    None => format!("entries at {min_severity} or above"),
                };
                format!(
                    "{count} or more {subject} within {}s",
                    window.as_secs_f64()
                )
            }
            TriggerCondition::Occurrence { pattern } => format!("pattern `{pattern}` matched"),
            TriggerCondition::ProcessExited => "process exited unexpectedly".to_string(),
            TriggerCondition::PortClosed => "monitored port closed".to_string(),
        }
    }

    fn state(&mut self, id: &str, pane: &PaneAddress) -> &mut RuleState {
        self.states
            .entry((id.to_string(), pane.clone()))
            .or_default()
    }

    fn rule_window(&self, window_ms: Option<u64>) -> Duration {
        window_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_window)
    }
}

fn applies_to(rule: &TriggerRule, pane: &PaneAddress) -> bool {
    rule.pane.as_ref().is_none_or(|filter| filter == pane)
}

fn entry_context(entry: &ErrorEntry, count: Option<usize>) -> serde_json::Value {
    let mut context = json!({
        "pattern": entry.pattern,
        "severity": entry.severity,
        "line": entry.line,
        "fields": entry.fields,
        "timestamp": entry.timestamp,
    });
    if let (Some(count), Some(map)) = (count, context.as_object_mut()) {
        map.insert("count".to_string(), json!(count));
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn pane() -> PaneAddress {
        "dev:main.0".parse().expect("address")
    }

    fn entry(pattern: &str, severity: Severity) -> ErrorEntry {
        ErrorEntry {
            pane: pane(),
            timestamp: Utc::now(),
            line: format!("{pattern} happened"),
            line_no: 1,
            pattern: pattern.to_string(),
            severity,
            language: None,
            fields: BTreeMap::new(),
        }
    }

    fn threshold_rule(count: u32, window_ms: u64, debounce_ms: u64) -> TriggerRule {
        TriggerRule {
            id: "burst".to_string(),
            sink: "ops".to_string(),
            condition: TriggerCondition::Threshold {
                count,
                min_severity: Severity::Error,
                window_ms: Some(window_ms),
                pattern: None,
            },
            debounce_ms: Some(debounce_ms),
            pane: None,
        }
    }

    fn engine() -> TriggerEngine {
        TriggerEngine::new(Duration::from_secs(300), Duration::from_secs(30))
    }

    #[test]
    fn burst_fires_exactly_once_per_edge() {
        let mut engine = engine();
        engine
            .add_rule(threshold_rule(3, 10_000, 60_000))
            .expect("rule");
        let start = Instant::now();
        let mut fired = Vec::new();
        for i in 0..10 {
            let now = start + Duration::from_millis(i * 100);
            fired.extend(engine.observe_entry(&entry("node-error", Severity::Error), now));
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule_id, "burst");
        assert_eq!(fired[0].sink_id, "ops");
        assert_eq!(fired[0].context["count"], json!(3));
    }

    #[test]
    fn refires_only_after_rearm_and_debounce() {
        let mut engine = engine();
        engine
            .add_rule(threshold_rule(3, 1_000, 5_000))
            .expect("rule");
        let start = Instant::now();
        let burst = |engine: &mut TriggerEngine, at: Instant| -> usize {
            (0..3)
                .map(|i| {
                    engine
                        .observe_entry(
                            &entry("node-error", Severity::Error),
                            at + Duration::from_millis(i * 10),
                        )
                        .len()
                })
                .sum()
        };

        assert_eq!(burst(&mut engine, start), 1);
        // Re-armed by the window, but still inside the debounce interval.
        assert_eq!(burst(&mut engine, start + Duration::from_secs(2)), 0);
        // Re-armed and past the debounce interval.
        assert_eq!(burst(&mut engine, start + Duration::from_secs(6)), 1);
    }

    #[test]
    fn sustained_flood_keeps_an_exact_windowed_count() {
        let mut engine = engine();
        engine
            .add_rule(threshold_rule(40_000, 2_000, 0))
            .expect("rule");
        let start = Instant::now();
        let e = entry("node-error", Severity::Error);
        let mut fired = Vec::new();
        // 50 entries per millisecond, so the 2s window holds at most 100k.
        for i in 0..60_000u64 {
            let now = start + Duration::from_micros(i * 20);
            fired.extend(engine.observe_entry(&e, now));
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].context["count"], json!(40_000));

        // After a quiet gap longer than the window the count starts over.
        let later = start + Duration::from_secs(10);
        let fired = engine.observe_entry(&e, later);
        assert!(fired.is_empty());
        let state = engine
            .states
            .get(&("burst".to_string(), pane()))
            .expect("state");
        assert_eq!(state.hits.len(), 1);
        assert!(!state.satisfied);
    }

    #[test]
    fn severity_and_pattern_filters_apply() {
        let mut engine = engine();
        engine
            .add_rule(TriggerRule {
                id: "py".to_string(),
                sink: "ops".to_string(),
                condition: TriggerCondition::Threshold {
                    count: 2,
                    min_severity: Severity::Warning,
                    window_ms: None,
                    pattern: Some("python-exception".to_string()),
                },
                debounce_ms: None,
                pane: None,
            })
            .expect("rule");
        let now = Instant::now();
        assert!(
            engine
                .observe_entry(&entry("node-error", Severity::Error), now)
                .is_empty()
        );
        assert!(
            engine
                .observe_entry(&entry("python-exception", Severity::Error), now)
                .is_empty()
        );
        assert_eq!(
            engine
                .observe_entry(&entry("python-exception", Severity::Warning), now)
                .len(),
            1
        );
    }

    #[test]
    fn occurrence_rules_fire_per_match_subject_to_debounce() {
        let mut engine = engine();
        engine
            .add_rule(TriggerRule {
                id: "npm".to_string(),
                sink: "ops".to_string(),
                condition: TriggerCondition::Occurrence {
                    pattern: "npm-err".to_string(),
                },
                debounce_ms: Some(1_000),
                pane: None,
            })
            .expect("rule");
        let start = Instant::now();
        let e = entry("npm-err", Severity::Error);
        assert_eq!(engine.observe_entry(&e, start).len(), 1);
        assert_eq!(
            engine
                .observe_entry(&e, start + Duration::from_millis(500))
                .len(),
            0
        );
        assert_eq!(
            engine
                .observe_entry(&e, start + Duration::from_millis(1_500))
                .len(),
            1
        );
    }

    #[test]
    fn lifecycle_events_bypass_counters() {
        let mut engine = engine();
        engine
            .add_rule(TriggerRule {
                id: "exit".to_string(),
                sink: "ops".to_string(),
                condition: TriggerCondition::ProcessExited,
                debounce_ms: Some(0),
                pane: Some(pane()),
            })
            .expect("rule");
        let event = LifecycleEvent {
            pane: pane(),
            kind: LifecycleKind::ProcessExited {
                pid: 77,
                exit_code: Some(1),
            },
            at: Utc::now(),
        };
        let fired = engine.observe_lifecycle(&event, Instant::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].context["pid"], json!(77));

        let other = LifecycleEvent {
            pane: "dev:main.1".parse().expect("address"),
            ..event
        };
        assert!(engine.observe_lifecycle(&other, Instant::now()).is_empty());
        assert_eq!(engine.rules()[0].fire_count, 1);
    }

    #[test]
    fn rule_management_reports_typed_errors() {
        let mut engine = engine();
        engine
            .add_rule(threshold_rule(1, 1_000, 0))
            .expect("rule");
        assert_matches!(
            engine.add_rule(threshold_rule(1, 1_000, 0)),
            Err(OrchestratorError::DuplicateRule { .. })
        );
        assert_matches!(
            engine.add_rule(TriggerRule {
                id: "zero".to_string(),
                ..threshold_rule(0, 1_000, 0)
            }),
            Err(OrchestratorError::InvalidRule { .. })
        );
        engine.remove_rule("burst").expect("remove");
        assert_matches!(
            engine.remove_rule("burst"),
            Err(OrchestratorError::RuleNotFound { .. })
        );
    }

    #[test]
    fn trigger_event_uses_camel_case_contract() {
        let event = TriggerEvent {
            sink_id: "ops".to_string(),
            rule_id: "burst".to_string(),
            pane: pane(),
            reason: "r".to_string(),
            context: json!({}),
            fired_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .expect("timestamp")
                .with_timezone(&Utc),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["sinkId"], json!("ops"));
        assert_eq!(value["ruleId"], json!("burst"));
        assert_eq!(value["paneAddr"], json!("dev:main.0"));
        assert!(value.get("firedAt").is_some());
    }
}
