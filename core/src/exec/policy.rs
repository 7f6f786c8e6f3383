use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;

use regex_lite::Regex;
use tracing::debug;

use crate::config::CommandPolicyConfig;
use crate::error::OrchestratorError;
use crate::error::Result;

const HARD_DENY: &[(&str, &str)] = &[
    (
        r"\brm\s+(?:-\S*\s+)*-\S*[rR]\S*\s+(?:-\S*\s+)*(?:/\*?|~/?|\*)(?:\s|;|&|\||$)",
        "recursive delete of a root, home or wildcard path",
    ),
    (
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
    (r"\bmkfs(?:\.\w+)?\b", "filesystem formatting"),
    (r"\bdd\b.*\bof=/dev/", "raw device write"),
    (
        r">\s*/dev/(?:sd|hd|nvme|disk|mmcblk|xvd)",
        "raw device write",
    ),
    (
        r"\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b",
        "piping a download into a shell",
    ),
    (r"\bchmod\s+(?:-\S+\s+)*0?777\s+/(?:\s|$)", "opening permissions on /"),
    (
        r"(?:^|[;&|]\s*)(?:sudo\s+)?(?:shutdown|reboot|halt|poweroff)\b",
        "host power control",
    ),
];

/// A command line that passed [`CommandPolicy::validate_command`]. Backends
/// only accept this type, so nothing reaches a process unchecked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    line: String,
    programs: Vec<String>,
}

impl ValidatedCommand {
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Programs invoked by each chained segment, in order.
    pub fn programs(&self) -> &[String] {
        &self.programs
    }
}

/// Raw bytes accepted for a pane's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInput(Vec<u8>);

impl ValidatedInput {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&ValidatedCommand> for ValidatedInput {
    fn from(command: &ValidatedCommand) -> Self {
        Self(format!("{}\n", command.line).into_bytes())
    }
}

/// What has been typed on a pane's current line since it was last submitted
/// or cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingLine {
    text: String,
    /// Set by cursor or history keys, whose effect on the line is unknown.
    opaque: bool,
}

impl PendingLine {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && !self.opaque
    }
}

#[derive(Debug)]
pub struct CommandPolicy {
    allowed_programs: HashSet<String>,
    allow_substitution: bool,
    deny: Vec<(Regex, String)>,
}

struct Scan<'a> {
    segments: Vec<&'a str>,
    chained: bool,
    substitution: bool,
}

impl CommandPolicy {
    pub fn new(config: &CommandPolicyConfig) -> Result<Self> {
        let mut deny = Vec::with_capacity(HARD_DENY.len() + config.extra_deny_patterns.len());
        for (pattern, reason) in HARD_DENY {
            let regex = Regex::new(pattern)
                .map_err(|err| OrchestratorError::invalid_pattern(*reason, err))?;
            deny.push((regex, (*reason).to_string()));
        }
        for pattern in &config.extra_deny_patterns {
            let regex = Regex::new(pattern)
                .map_err(|err| OrchestratorError::invalid_pattern(pattern.clone(), err))?;
            deny.push((regex, format!("matches deny pattern `{pattern}`")));
        }
        Ok(Self {
            allowed_programs: config.allowed_programs.iter().cloned().collect(),
            allow_substitution: config.allow_substitution,
            deny,
        })
    }

    pub fn validate_command(&self, command: &str) -> Result<ValidatedCommand> {
        let line = command.trim();
        if line.is_empty() {
            return Err(OrchestratorError::unsafe_command("command is empty"));
        }
        if let Some(bad) = line.chars().find(|c| c.is_control() && *c != '\t') {
            return Err(OrchestratorError::unsafe_command(format!(
                "command contains control character {bad:?}"
            )));
        }
        for (regex, reason) in &self.deny {
            if regex.is_match(line) {
                return Err(OrchestratorError::unsafe_command(reason.clone()));
            }
        }

        let scan = scan(line)?;
        if scan.substitution && !self.allow_substitution {
            return Err(OrchestratorError::unsafe_command(
                "command substitution is not allowed",
            ));
        }

        let mut programs = Vec::with_capacity(scan.segments.len());
        for segment in scan.segments {
            if let Some(program) = segment_program(segment)? {
                programs.push(program);
            }
        }
        if programs.is_empty() {
            return Err(OrchestratorError::unsafe_command("command has no program"));
        }
        if scan.chained {
            if let Some(denied) = programs
                .iter()
                .find(|program| !self.allowed_programs.contains(program.as_str()))
            {
                return Err(OrchestratorError::unsafe_command(format!(
                    "chained command uses `{denied}`, which is not on the allow-list"
                )));
            }
        }
        debug!(command = line, ?programs, "command accepted");
        Ok(ValidatedCommand {
            line: line.to_string(),
            programs,
        })
    }

    /// Validates `input` as the continuation of `pending`, the pane's current
    /// line. Every line the chunk completes is checked as a whole command, so
    /// a denied command cannot be smuggled in pieces. Returns the bytes to
    /// write and the line state after them.
    ///
    /// Ctrl-C and Ctrl-U discard the line, backspace drops its last character.
    /// A standalone escape sequence (arrow keys) is accepted on an empty line
    /// but leaves the line opaque: until it is submitted or discarded no more
    /// text may be typed onto it.
    pub fn validate_input(
        &self,
        pending: &PendingLine,
        input: &[u8],
    ) -> Result<(ValidatedInput, PendingLine)> {
        if input.is_empty() {
            return Err(OrchestratorError::unsafe_command("input is empty"));
        }
        if is_escape_sequence(input) {
            if !pending.text.is_empty() {
                return Err(OrchestratorError::unsafe_command(
                    "escape sequences cannot edit a partially typed line",
                ));
            }
            let line = PendingLine {
                text: String::new(),
                opaque: true,
            };
            return Ok((ValidatedInput(input.to_vec()), line));
        }
        let text = std::str::from_utf8(input)
            .map_err(|_| OrchestratorError::unsafe_command("input is not valid UTF-8"))?;

        let mut line = pending.clone();
        for c in text.chars() {
            match c {
                '\r' | '\n' => {
                    if !line.opaque && !line.text.trim().is_empty() {
                        self.validate_command(&line.text)?;
                    }
                    line = PendingLine::default();
                }
                '\u{3}' | '\u{15}' => line = PendingLine::default(),
                _ if line.opaque => {
                    return Err(OrchestratorError::unsafe_command(
                        "line was edited with cursor keys; submit or cancel it first",
                    ));
                }
                '\u{8}' | '\u{7f}' => {
                    line.text.pop();
                }
                '\t' => line.text.push(c),
                '\u{1b}' => {
                    return Err(OrchestratorError::unsafe_command(
                        "escape sequences must be sent on their own",
                    ));
                }
                c if c.is_control() => {
                    if !line.text.is_empty() {
                        return Err(OrchestratorError::unsafe_command(format!(
                            "control character {c:?} cannot be sent on a partially typed line"
                        )));
                    }
                }
                c => line.text.push(c),
            }
        }
        Ok((ValidatedInput(input.to_vec()), line))
    }

    /// Checks `command` as it will land on the pane's line, after whatever
    /// text is already pending there.
    pub fn validate_on_line(&self, pending: &PendingLine, command: &ValidatedCommand) -> Result<()> {
        if pending.opaque {
            return Err(OrchestratorError::unsafe_command(
                "pane line was edited with cursor keys; cancel it first",
            ));
        }
        if !pending.text.is_empty() {
            self.validate_command(&format!("{}{}", pending.text, command.as_str()))?;
        }
        Ok(())
    }
}

/// Quotes a single argument for safe interpolation into a command line.
pub fn escape(arg: &str) -> Result<Cow<'_, str>> {
    shlex::try_quote(arg).map_err(|err| OrchestratorError::unsafe_command(err.to_string()))
}

fn is_escape_sequence(input: &[u8]) -> bool {
    input.first() == Some(&0x1b)
        && input.len() <= 8
        && input[1..].iter().all(u8::is_ascii_graphic)
}

/// Splits `line` into chained segments, honouring quotes and escapes.
fn scan(line: &str) -> Result<Scan<'_>> {
    let bytes = line.as_bytes();
    let mut segments = Vec::new();
    let mut chained = false;
    let mut substitution = false;
    let mut single = false;
    let mut double = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if single {
            if b == b'\'' {
                single = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'\\' => {
                i += 2;
                continue;
            }
            b'\'' if !double => single = true,
            b'"' => double = !double,
            b'`' => substitution = true,
            b'$' if bytes.get(i + 1) == Some(&b'(') => substitution = true,
            b';' | b'\n' if !double => {
                segments.push(&line[start..i]);
                chained = true;
                start = i + 1;
            }
            b'|' | b'&' if !double => {
                let redirect = b == b'&'
                    && (i > 0 && matches!(bytes[i - 1], b'>' | b'<')
                        || bytes.get(i + 1) == Some(&b'>'));
                if !redirect {
                    segments.push(&line[start..i]);
                    chained = true;
                    let doubled = bytes.get(i + 1) == Some(&b);
                    i += if doubled { 2 } else { 1 };
                    start = i;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }

    if single || double {
        return Err(OrchestratorError::unsafe_command("unbalanced quotes"));
    }
    if start < line.len() {
        segments.push(&line[start..]);
    }
    Ok(Scan {
        segments,
        chained,
        substitution,
    })
}

fn segment_program(segment: &str) -> Result<Option<String>> {
    let Some(tokens) = shlex::split(segment) else {
        return Err(OrchestratorError::unsafe_command("unbalanced quotes"));
    };
    let program = tokens.into_iter().find(|token| !is_env_assignment(token));
    Ok(program.map(|program| {
        Path::new(&program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(program)
    }))
}

fn is_env_assignment(token: &str) -> bool {
    let Some((name, _)) = token.split_once('=') else {
        return false;
    };
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
