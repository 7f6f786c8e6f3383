use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::OrchestratorError;

const MAX_NAME_LEN: usize = 64;

/// Address of a window inside a session, rendered as `session:window`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowAddress {
    session: String,
    window: String,
}

/// Structured pane handle, rendered as `session:window.index`.
///
/// The address is derived from the pane's topology position and is the only
/// handle callers use to refer to a pane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaneAddress {
    session: String,
    window: String,
    index: u32,
}

impl WindowAddress {
    pub fn new(session: &str, window: &str) -> Result<Self, OrchestratorError> {
        validate_name("session", session)?;
        validate_name("window", window)?;
        Ok(Self {
            session: session.to_string(),
            window: window.to_string(),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn window(&self) -> &str {
        &self.window
    }

    pub fn pane(&self, index: u32) -> PaneAddress {
        PaneAddress {
            session: self.session.clone(),
            window: self.window.clone(),
            index,
        }
    }
}

impl PaneAddress {
    pub fn new(session: &str, window: &str, index: u32) -> Result<Self, OrchestratorError> {
        Ok(WindowAddress::new(session, window)?.pane(index))
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn window(&self) -> &str {
        &self.window
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn window_address(&self) -> WindowAddress {
        WindowAddress {
            session: self.session.clone(),
            window: self.window.clone(),
        }
    }

    /// Log capture path relative to the logs dir: `<session>/<window>.<index>.log`.
    /// Each session gets its own directory so equal window names never share
    /// a file.
    pub fn log_relative_path(&self) -> PathBuf {
        PathBuf::from(&self.session).join(format!("{}.{}.log", self.window, self.index))
    }
}

/// Session, window and generated names share one alphabet so addresses can be
/// split unambiguously on `:` and `.`.
pub fn validate_name(kind: &str, name: &str) -> Result<(), OrchestratorError> {
    if name.is_empty() {
        return Err(OrchestratorError::invalid_address(
            name,
            format!("{kind} name must not be empty"),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(OrchestratorError::invalid_address(
            name,
            format!("{kind} name exceeds {MAX_NAME_LEN} characters"),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(OrchestratorError::invalid_address(
            name,
            format!("{kind} name contains unsupported character `{bad}`"),
        ));
    }
    Ok(())
}

impl fmt::Display for WindowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.window)
    }
}

impl fmt::Display for PaneAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.session, self.window, self.index)
    }
}

impl FromStr for WindowAddress {
    type Err = OrchestratorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((session, window)) = input.split_once(':') else {
            return Err(OrchestratorError::invalid_address(
                input,
                "expected `session:window`",
            ));
        };
        Self::new(session, window)
    }
}

impl FromStr for PaneAddress {
    type Err = OrchestratorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((session, rest)) = input.split_once(':') else {
            return Err(OrchestratorError::invalid_address(
                input,
                "expected `session:window.index`",
            ));
        };
        let Some((window, index)) = rest.rsplit_once('.') else {
            return Err(OrchestratorError::invalid_address(
                input,
                "missing `.index` suffix",
            ));
        };
        let index = index.parse::<u32>().map_err(|err| {
            OrchestratorError::invalid_address(input, format!("invalid pane index: {err}"))
        })?;
        Self::new(session, window, index)
    }
}

impl TryFrom<String> for WindowAddress {
    type Error = OrchestratorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for PaneAddress {
    type Error = OrchestratorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WindowAddress> for String {
    fn from(value: WindowAddress) -> Self {
        value.to_string()
    }
}

impl From<PaneAddress> for String {
    fn from(value: PaneAddress) -> Self {
        value.to_string()
    }
}
