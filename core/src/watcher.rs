//! Tail-following log reader that turns raw pane output into lines.

use std::borrow::Cow;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::PaneAddress;

const READ_CHUNK_BYTES: usize = 64 * 1024;
const MAX_FAILED_REOPENS: u32 = 2;
const MAX_BACKOFF_FACTOR: u32 = 8;
const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub pane: PaneAddress,
    pub text: String,
    /// Counts lines across every watch of the pane, starting at 1.
    pub line_no: u64,
    pub observed_at: DateTime<Utc>,
}

/// Where a watch stopped: the byte offset past the last complete line and
/// the number of lines handed out so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub offset: u64,
    pub line_no: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    Watching,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    /// Stop automatically once this much time has passed.
    pub duration: Option<Duration>,
    pub max_line_bytes: usize,
}

/// Splits a byte stream into lines. Bytes after the last newline stay
/// buffered until more input or an explicit flush.
#[derive(Debug)]
pub struct LineAssembler {
    partial: Vec<u8>,
    /// Stream bytes behind `partial`, including any dropped by truncation.
    partial_consumed: usize,
    overflowed: bool,
    max_line_bytes: usize,
}

impl LineAssembler {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            partial_consumed: 0,
            overflowed: false,
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.extend_partial(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.extend_partial(rest);
        lines
    }

    /// Emits the buffered partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial_consumed == 0 {
            return None;
        }
        Some(self.take_line())
    }

    /// Bytes consumed from the stream that have not formed a line yet.
    pub fn pending(&self) -> usize {
        self.partial_consumed
    }

    pub fn discard(&mut self) {
        self.partial.clear();
        self.partial_consumed = 0;
        self.overflowed = false;
    }

    fn extend_partial(&mut self, bytes: &[u8]) {
        self.partial_consumed += bytes.len();
        let room = self.max_line_bytes.saturating_sub(self.partial.len());
        if bytes.len() > room {
            self.overflowed = true;
        }
        self.partial.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn take_line(&mut self) -> String {
        self.partial_consumed = 0;
        let mut raw = std::mem::take(&mut self.partial);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let decoded = String::from_utf8_lossy(&raw);
        let mut line = strip_ansi(&decoded).into_owned();
        if std::mem::take(&mut self.overflowed) {
            truncate_utf8_safe(&mut line, self.max_line_bytes, TRUNCATION_MARKER);
            if !line.ends_with(TRUNCATION_MARKER) {
                line.push_str(TRUNCATION_MARKER);
            }
        }
        line
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize, marker: &str) {
    if s.len() <= max_bytes {
        return;
    }
    let mut truncate_pos = max_bytes;
    while truncate_pos > 0 && !s.is_char_boundary(truncate_pos) {
        truncate_pos -= 1;
    }
    s.truncate(truncate_pos);
    s.push_str(marker);
}

/// Removes terminal escape sequences (CSI, OSC and two-byte escapes) and
/// stray carriage returns left by the shell's line editing.
pub fn strip_ansi(input: &str) -> Cow<'_, str> {
    if !input.contains(['\u{1b}', '\r']) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.next() {
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\r' => {}
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(unix)]
type FileIdentity = (u64, u64);

#[cfg(not(unix))]
type FileIdentity = ();

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

/// Read position in a pane log, tolerant of truncation and rotation.
struct LogTail {
    pane: PaneAddress,
    path: PathBuf,
    file: Option<File>,
    identity: Option<FileIdentity>,
    offset: u64,
    /// End of the last complete line; the resume point after a re-open.
    stable_offset: u64,
    needs_reopen: bool,
    failed_reopens: u32,
}

impl LogTail {
    fn new(pane: PaneAddress, path: PathBuf, start_offset: u64) -> Self {
        Self {
            pane,
            path,
            file: None,
            identity: None,
            offset: start_offset,
            stable_offset: start_offset,
            needs_reopen: false,
            failed_reopens: 0,
        }
    }

    async fn poll(&mut self, assembler: &mut LineAssembler) -> Vec<String> {
        if self.needs_reopen {
            self.reopen(assembler).await;
            if self.needs_reopen {
                return Vec::new();
            }
        }

        if self.file.is_none() {
            match self.open_at(self.offset).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
                Err(err) => {
                    warn!(pane = %self.pane, path = %self.path.display(), "failed to open log: {err}");
                    self.mark_reopen(assembler);
                    return Vec::new();
                }
            }
        }

        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                let rotated = self.identity.is_some() && file_identity(&meta) != self.identity;
                if rotated || meta.len() < self.offset {
                    warn!(
                        pane = %self.pane,
                        path = %self.path.display(),
                        offset = self.stable_offset,
                        "log was truncated or rotated; reopening at last stable offset"
                    );
                    self.mark_reopen(assembler);
                    return Vec::new();
                }
            }
            Err(err) => {
                warn!(pane = %self.pane, path = %self.path.display(), "log disappeared: {err}");
                self.mark_reopen(assembler);
                return Vec::new();
            }
        }

        let mut lines = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            let Some(file) = self.file.as_mut() else {
                break;
            };
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    lines.extend(assembler.push(&buf[..n]));
                    self.offset += n as u64;
                    self.stable_offset = self.offset - assembler.pending() as u64;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(pane = %self.pane, path = %self.path.display(), "log read failed: {err}");
                    self.mark_reopen(assembler);
                    break;
                }
            }
        }
        lines
    }

    /// Treats everything buffered as complete, so the resume point moves to
    /// the end of what has been read.
    fn flush(&mut self, assembler: &mut LineAssembler) -> Option<String> {
        let line = assembler.flush();
        self.stable_offset = self.offset;
        line
    }

    fn mark_reopen(&mut self, assembler: &mut LineAssembler) {
        self.file = None;
        self.needs_reopen = true;
        assembler.discard();
    }

    async fn reopen(&mut self, assembler: &mut LineAssembler) {
        let target = self.stable_offset;
        let len = tokio::fs::metadata(&self.path).await.map(|meta| meta.len());
        let reopened = match len {
            Ok(len) if len >= target => self.open_at(target).await.is_ok(),
            _ => false,
        };
        if reopened {
            self.offset = target;
            self.needs_reopen = false;
            self.failed_reopens = 0;
            debug!(pane = %self.pane, offset = target, "log reopened");
            return;
        }

        self.failed_reopens += 1;
        if self.failed_reopens >= MAX_FAILED_REOPENS {
            warn!(
                pane = %self.pane,
                path = %self.path.display(),
                "log could not be reopened at offset {target}; restarting from the beginning"
            );
            self.offset = 0;
            self.stable_offset = 0;
            self.failed_reopens = 0;
            assembler.discard();
            self.needs_reopen = self.open_at(0).await.is_err();
        }
    }

    async fn open_at(&mut self, offset: u64) -> std::io::Result<()> {
        let mut file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        self.identity = file_identity(&meta);
        self.file = Some(file);
        Ok(())
    }
}

/// Handle to a running per-pane watcher task.
#[derive(Debug)]
pub struct LogWatcher {
    pane: PaneAddress,
    state: Arc<StdMutex<WatcherState>>,
    cancel: CancellationToken,
    flush: Arc<Notify>,
    offset: Arc<AtomicU64>,
    line_no: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl LogWatcher {
    /// Starts tailing `path` from `start`, sending lines into `lines`. Line
    /// numbers continue after `start.line_no`. Sends wait for capacity, so a
    /// slow consumer slows the watcher instead of losing lines.
    pub fn spawn(
        pane: PaneAddress,
        path: PathBuf,
        start: StreamPosition,
        options: WatchOptions,
        lines: mpsc::Sender<LogLine>,
    ) -> Self {
        let state = Arc::new(StdMutex::new(WatcherState::Idle));
        let cancel = CancellationToken::new();
        let flush = Arc::new(Notify::new());
        let offset = Arc::new(AtomicU64::new(start.offset));
        let line_no = Arc::new(AtomicU64::new(start.line_no));
        let handle = tokio::spawn(run_watcher(
            LogTail::new(pane.clone(), path, start.offset),
            options,
            lines,
            WatcherShared {
                state: state.clone(),
                cancel: cancel.clone(),
                flush: flush.clone(),
                offset: offset.clone(),
                line_no: line_no.clone(),
            },
        ));
        Self {
            pane,
            state,
            cancel,
            flush,
            offset,
            line_no,
            handle,
        }
    }

    pub fn pane(&self) -> &PaneAddress {
        &self.pane
    }

    pub fn state(&self) -> WatcherState {
        read_state(&self.state)
    }

    /// Just past the last line handed out; a later watch resumes here.
    pub fn position(&self) -> StreamPosition {
        StreamPosition {
            offset: self.offset.load(Ordering::SeqCst),
            line_no: self.line_no.load(Ordering::SeqCst),
        }
    }

    /// Emits any buffered partial line at the next opportunity.
    pub fn flush(&self) {
        self.flush.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the watcher and waits for the in-flight read and emit to finish.
    pub async fn shutdown(mut self) -> StreamPosition {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
        self.position()
    }
}

struct WatcherShared {
    state: Arc<StdMutex<WatcherState>>,
    cancel: CancellationToken,
    flush: Arc<Notify>,
    offset: Arc<AtomicU64>,
    line_no: Arc<AtomicU64>,
}

impl WatcherShared {
    fn publish(&self, tail: &LogTail, line_no: u64) {
        self.offset.store(tail.stable_offset, Ordering::SeqCst);
        self.line_no.store(line_no, Ordering::SeqCst);
    }
}

fn read_state(state: &StdMutex<WatcherState>) -> WatcherState {
    match state.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn set_state(state: &StdMutex<WatcherState>, next: WatcherState) {
    match state.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

async fn run_watcher(
    mut tail: LogTail,
    options: WatchOptions,
    lines: mpsc::Sender<LogLine>,
    shared: WatcherShared,
) {
    let pane = tail.pane.clone();
    let mut assembler = LineAssembler::new(options.max_line_bytes);
    let mut line_no = shared.line_no.load(Ordering::SeqCst);
    let mut idle_polls = 0u32;
    let deadline = options.duration.map(|duration| Instant::now() + duration);
    let expiry = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    set_state(&shared.state, WatcherState::Watching);
    info!(pane = %pane, path = %tail.path.display(), offset = tail.offset, "watching pane log");

    'watch: loop {
        let backoff = options.poll_interval * idle_polls.clamp(1, MAX_BACKOFF_FACTOR);
        let mut flush_requested = false;
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break 'watch,
            _ = &mut expiry => {
                info!(pane = %pane, "watch duration elapsed");
                break 'watch;
            }
            _ = shared.flush.notified() => flush_requested = true,
            _ = tokio::time::sleep(backoff) => {}
        }

        let mut batch = tail.poll(&mut assembler).await;
        if flush_requested {
            batch.extend(tail.flush(&mut assembler));
        }
        idle_polls = if batch.is_empty() {
            idle_polls.saturating_add(1)
        } else {
            0
        };

        for text in batch {
            line_no += 1;
            let line = LogLine {
                pane: pane.clone(),
                text,
                line_no,
                observed_at: Utc::now(),
            };
            if lines.send(line).await.is_err() {
                debug!(pane = %pane, "line consumer dropped; stopping watcher");
                break 'watch;
            }
        }
        shared.publish(&tail, line_no);
    }

    shared.publish(&tail, line_no);
    set_state(&shared.state, WatcherState::Stopped);
    debug!(pane = %pane, offset = tail.stable_offset, "watcher stopped");
}
