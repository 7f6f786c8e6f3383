use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration. Every field has a default so an empty TOML file is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub shell_args: Vec<String>,

    #[serde(default = "default_pty_rows")]
    pub pty_rows: u16,

    #[serde(default = "default_pty_cols")]
    pub pty_cols: u16,

    /// Capacity of each pane's error history.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Sliding window used by threshold counters when a rule does not set one.
    #[serde(default = "default_counter_window_ms")]
    pub counter_window_ms: u64,

    #[serde(default = "default_debounce_ms")]
    pub default_debounce_ms: u64,

    #[serde(default = "default_grace_timeout_ms")]
    pub grace_timeout_ms: u64,

    #[serde(default = "default_watch_poll_interval_ms")]
    pub watch_poll_interval_ms: u64,

    #[serde(default = "default_snapshot_debounce_ms")]
    pub snapshot_debounce_ms: u64,

    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,

    #[serde(default = "default_port_probe_interval_ms")]
    pub port_probe_interval_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub line_channel_capacity: usize,

    #[serde(default = "default_channel_capacity")]
    pub entry_channel_capacity: usize,

    /// Longest log line kept; longer lines are truncated on a char boundary.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    #[serde(default)]
    pub command_policy: CommandPolicyConfig,

    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandPolicyConfig {
    /// Programs that may appear in a chained command (`a && b`, `a | b`).
    #[serde(default)]
    pub allowed_programs: Vec<String>,

    #[serde(default)]
    pub allow_substitution: bool,

    /// Additional regexes that reject a command outright.
    #[serde(default)]
    pub extra_deny_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SinkConfig {
    pub id: String,
    pub kind: SinkKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Emits fired triggers as `tracing` events.
    Log,
    /// Writes fired triggers to stdout as JSON lines.
    Stdout,
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("panewatch")
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_pty_rows() -> u16 {
    24
}

fn default_pty_cols() -> u16 {
    120
}

fn default_ring_capacity() -> usize {
    500
}

fn default_counter_window_ms() -> u64 {
    5 * 60 * 1000
}

fn default_debounce_ms() -> u64 {
    30_000
}

fn default_grace_timeout_ms() -> u64 {
    5_000
}

fn default_watch_poll_interval_ms() -> u64 {
    100
}

fn default_snapshot_debounce_ms() -> u64 {
    500
}

fn default_snapshot_interval_ms() -> u64 {
    60_000
}

fn default_sink_timeout_ms() -> u64 {
    5_000
}

fn default_port_probe_interval_ms() -> u64 {
    2_000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_line_bytes() -> usize {
    16 * 1024
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            shell: default_shell(),
            shell_args: Vec::new(),
            pty_rows: default_pty_rows(),
            pty_cols: default_pty_cols(),
            ring_capacity: default_ring_capacity(),
            counter_window_ms: default_counter_window_ms(),
            default_debounce_ms: default_debounce_ms(),
            grace_timeout_ms: default_grace_timeout_ms(),
            watch_poll_interval_ms: default_watch_poll_interval_ms(),
            snapshot_debounce_ms: default_snapshot_debounce_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            sink_timeout_ms: default_sink_timeout_ms(),
            port_probe_interval_ms: default_port_probe_interval_ms(),
            line_channel_capacity: default_channel_capacity(),
            entry_channel_capacity: default_channel_capacity(),
            max_line_bytes: default_max_line_bytes(),
            command_policy: CommandPolicyConfig::default(),
            sinks: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads the config from `path`, or returns the defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn counter_window(&self) -> Duration {
        Duration::from_millis(self.counter_window_ms)
    }

    pub fn default_debounce(&self) -> Duration {
        Duration::from_millis(self.default_debounce_ms)
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms.max(1))
    }

    pub fn snapshot_debounce(&self) -> Duration {
        Duration::from_millis(self.snapshot_debounce_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(1))
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn port_probe_interval(&self) -> Duration {
        Duration::from_millis(self.port_probe_interval_ms.max(1))
    }
}
