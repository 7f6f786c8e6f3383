//! Language-aware error classification of pane log lines.
//!
//! Patterns are tried in registration order and the first match wins. Each
//! pane keeps a bounded history of the entries it produced.

mod builtin;
mod ring;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;

use crate::address::PaneAddress;
use crate::error::OrchestratorError;
use crate::watcher::LogLine;

pub use builtin::builtin_patterns;
pub use builtin::language_packs;
pub use ring::RingBuffer;

const TOP_MESSAGES: usize = 5;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// User-facing description of a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    pub regex: String,
    pub severity: Severity,
    #[serde(default)]
    pub language: Option<String>,
    /// Output field name to capture group (name or numeric index). When
    /// empty, every named group that participates in the match is captured.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("pattern name must not be empty")]
    EmptyName,
    #[error("pattern `{name}` does not compile: {source}")]
    Regex {
        name: String,
        #[source]
        source: regex_lite::Error,
    },
    #[error("pattern `{name}` maps field `{field}` to unknown group `{group}`")]
    UnknownGroup {
        name: String,
        field: String,
        group: String,
    },
}

impl From<ClassifierError> for OrchestratorError {
    fn from(err: ClassifierError) -> Self {
        let name = match &err {
            ClassifierError::EmptyName => String::new(),
            ClassifierError::Regex { name, .. } | ClassifierError::UnknownGroup { name, .. } => {
                name.clone()
            }
        };
        OrchestratorError::invalid_pattern(name, err)
    }
}

#[derive(Debug)]
pub struct ErrorPattern {
    spec: PatternSpec,
    regex: Regex,
}

impl ErrorPattern {
    pub fn compile(mut spec: PatternSpec) -> Result<Self, ClassifierError> {
        if spec.name.trim().is_empty() {
            return Err(ClassifierError::EmptyName);
        }
        spec.language = spec
            .language
            .map(|language| language.trim().to_ascii_lowercase())
            .filter(|language| !language.is_empty());
        let regex = Regex::new(&spec.regex).map_err(|source| ClassifierError::Regex {
            name: spec.name.clone(),
            source,
        })?;
        for (field, group) in &spec.fields {
            let known = match group.parse::<usize>() {
                Ok(index) => index < regex.captures_len(),
                Err(_) => regex.capture_names().flatten().any(|name| name == group),
            };
            if !known {
                return Err(ClassifierError::UnknownGroup {
                    name: spec.name.clone(),
                    field: field.clone(),
                    group: group.clone(),
                });
            }
        }
        Ok(Self { spec, regex })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    fn extract(&self, line: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.regex.captures(line)?;
        let mut fields = BTreeMap::new();
        if self.spec.fields.is_empty() {
            for name in self.regex.capture_names().flatten() {
                if let Some(value) = captures.name(name) {
                    fields.insert(name.to_string(), value.as_str().to_string());
                }
            }
            return Some(fields);
        }
        for (field, group) in &self.spec.fields {
            let value = match group.parse::<usize>() {
                Ok(index) => captures.get(index),
                Err(_) => captures.name(group),
            };
            if let Some(value) = value {
                fields.insert(field.clone(), value.as_str().to_string());
            }
        }
        Some(fields)
    }
}

/// Languages enabled for a watch. Untagged patterns always apply and an empty
/// filter enables every language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageFilter(Vec<String>);

impl LanguageFilter {
    pub fn new<I, S>(languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            languages
                .into_iter()
                .map(|language| language.as_ref().trim().to_ascii_lowercase())
                .filter(|language| !language.is_empty())
                .collect(),
        )
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn applies(&self, language: Option<&str>) -> bool {
        match language {
            None => true,
            Some(language) => self.0.is_empty() || self.0.iter().any(|l| l == language),
        }
    }

    pub fn languages(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternChange {
    Inserted,
    Replaced,
}

/// Ordered, shared pattern set. Writers take the exclusive lock; matching
/// clones the `Arc` list under the shared lock.
#[derive(Debug, Default)]
pub struct PatternSet {
    patterns: RwLock<Vec<Arc<ErrorPattern>>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Result<Self, ClassifierError> {
        let set = Self::new();
        for spec in builtin_patterns() {
            set.add(spec)?;
        }
        Ok(set)
    }

    /// Inserts a pattern, or replaces the one with the same name in place.
    pub fn add(&self, spec: PatternSpec) -> Result<PatternChange, ClassifierError> {
        let pattern = Arc::new(ErrorPattern::compile(spec)?);
        let mut guard = match self.patterns.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = guard.iter_mut().find(|p| p.name() == pattern.name()) {
            *slot = pattern;
            return Ok(PatternChange::Replaced);
        }
        guard.push(pattern);
        Ok(PatternChange::Inserted)
    }

    /// Returns false when no pattern had that name.
    pub fn remove(&self, name: &str) -> bool {
        let mut guard = match self.patterns.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guard.len();
        guard.retain(|pattern| pattern.name() != name);
        guard.len() != before
    }

    pub fn list(&self) -> Vec<PatternSpec> {
        self.snapshot()
            .iter()
            .map(|pattern| pattern.spec().clone())
            .collect()
    }

    pub fn classify(&self, line: &LogLine, languages: &LanguageFilter) -> Option<ErrorEntry> {
        self.snapshot()
            .iter()
            .filter(|pattern| languages.applies(pattern.spec.language.as_deref()))
            .find_map(|pattern| {
                pattern.extract(&line.text).map(|fields| ErrorEntry {
                    pane: line.pane.clone(),
                    timestamp: line.observed_at,
                    line: line.text.clone(),
                    line_no: line.line_no,
                    pattern: pattern.spec.name.clone(),
                    severity: pattern.spec.severity,
                    language: pattern.spec.language.clone(),
                    fields,
                })
            })
    }

    fn snapshot(&self) -> Vec<Arc<ErrorPattern>> {
        match self.patterns.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Structured record of one classified line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub pane: PaneAddress,
    pub timestamp: DateTime<Utc>,
    pub line: String,
    pub line_no: u64,
    pub pattern: String,
    pub severity: Severity,
    pub language: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl ErrorEntry {
    pub fn message(&self) -> &str {
        self.fields
            .get("message")
            .map(String::as_str)
            .filter(|message| !message.is_empty())
            .unwrap_or(&self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub pane: PaneAddress,
    /// Entries recorded for the pane across all of its watches, including
    /// ones evicted from the ring. Reset only when the pane goes away.
    pub total_seen: u64,
    pub by_severity: BTreeMap<Severity, usize>,
    pub entries: Vec<ErrorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStats {
    pub pattern: String,
    pub severity: Severity,
    pub count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCount {
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub pane: PaneAddress,
    pub retained: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub patterns: Vec<PatternStats>,
    pub top_messages: Vec<MessageCount>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Per-pane bounded histories. Readers always receive copies.
#[derive(Debug)]
pub struct ErrorHistory {
    capacity: usize,
    panes: RwLock<HashMap<PaneAddress, RingBuffer<ErrorEntry>>>,
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            panes: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, entry: ErrorEntry) {
        let mut guard = match self.panes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .entry(entry.pane.clone())
            .or_insert_with(|| RingBuffer::new(self.capacity))
            .push(entry);
    }

    pub fn forget(&self, pane: &PaneAddress) {
        let mut guard = match self.panes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(pane);
    }

    pub fn forget_session(&self, session: &str) {
        let mut guard = match self.panes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.retain(|pane, _| pane.session() != session);
    }

    pub fn summary(
        &self,
        pane: &PaneAddress,
        min_severity: Option<Severity>,
        limit: Option<usize>,
    ) -> ErrorSummary {
        let guard = match self.panes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(ring) = guard.get(pane) else {
            return ErrorSummary {
                pane: pane.clone(),
                total_seen: 0,
                by_severity: BTreeMap::new(),
                entries: Vec::new(),
            };
        };
        let floor = min_severity.unwrap_or(Severity::Info);
        let mut by_severity = BTreeMap::new();
        let mut entries: Vec<ErrorEntry> = Vec::new();
        for entry in ring.iter().filter(|entry| entry.severity >= floor) {
            *by_severity.entry(entry.severity).or_insert(0) += 1;
            entries.push(entry.clone());
        }
        if let Some(limit) = limit {
            let skip = entries.len().saturating_sub(limit);
            entries = entries.split_off(skip);
        }
        ErrorSummary {
            pane: pane.clone(),
            total_seen: ring.len() as u64 + ring.evicted(),
            by_severity,
            entries,
        }
    }

    pub fn analyze(&self, pane: &PaneAddress) -> ErrorAnalysis {
        let guard = match self.panes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entries: Vec<&ErrorEntry> = guard
            .get(pane)
            .map(|ring| ring.iter().collect())
            .unwrap_or_default();

        let mut by_severity = BTreeMap::new();
        let mut patterns: Vec<PatternStats> = Vec::new();
        let mut messages: Vec<MessageCount> = Vec::new();
        for entry in &entries {
            *by_severity.entry(entry.severity).or_insert(0) += 1;
            match patterns.iter_mut().find(|stats| stats.pattern == entry.pattern) {
                Some(stats) => {
                    stats.count += 1;
                    stats.last_seen = entry.timestamp;
                }
                None => patterns.push(PatternStats {
                    pattern: entry.pattern.clone(),
                    severity: entry.severity,
                    count: 1,
                    first_seen: entry.timestamp,
                    last_seen: entry.timestamp,
                }),
            }
            match messages.iter_mut().find(|m| m.message == entry.message()) {
                Some(message) => message.count += 1,
                None => messages.push(MessageCount {
                    message: entry.message().to_string(),
                    count: 1,
                }),
            }
        }
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        messages.sort_by(|a, b| b.count.cmp(&a.count));
        messages.truncate(TOP_MESSAGES);

        ErrorAnalysis {
            pane: pane.clone(),
            retained: entries.len(),
            by_severity,
            patterns,
            top_messages: messages,
            first_seen: entries.first().map(|entry| entry.timestamp),
            last_seen: entries.last().map(|entry| entry.timestamp),
        }
    }
}

/// Classifies every line of one pane, records matches and forwards them
/// downstream. Ends when the watcher drops its sender or the downstream
/// receiver goes away.
pub fn spawn_classifier(
    pane: PaneAddress,
    patterns: Arc<PatternSet>,
    languages: LanguageFilter,
    history: Arc<ErrorHistory>,
    mut lines: mpsc::Receiver<LogLine>,
    entries: mpsc::Sender<ErrorEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            let Some(entry) = patterns.classify(&line, &languages) else {
                trace!(pane = %pane, line = %line.text, "no pattern matched");
                continue;
            };
            debug!(
                pane = %pane,
                pattern = %entry.pattern,
                severity = %entry.severity,
                "classified log line"
            );
            history.record(entry.clone());
            if entries.send(entry).await.is_err() {
                break;
            }
        }
        debug!(pane = %pane, "classifier stopped");
    })
}
