use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use super::engine::TriggerEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink receiver dropped")]
    Closed,
    #[error("failed to encode trigger event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Destination for trigger events. Delivery is at-most-once; a failed
/// delivery is logged and never retried.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    fn id(&self) -> &str;

    async fn deliver(&self, event: &TriggerEvent) -> Result<(), SinkError>;
}

/// Forwards events to an in-process receiver.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    id: String,
    tx: mpsc::Sender<TriggerEvent>,
}

impl ChannelSink {
    pub fn new(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<TriggerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id: id.into(), tx }, rx)
    }
}

#[async_trait]
impl TriggerSink for ChannelSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &TriggerEvent) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Emits each event as a structured tracing record.
#[derive(Debug, Clone)]
pub struct TracingSink {
    id: String,
}

impl TracingSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl TriggerSink for TracingSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &TriggerEvent) -> Result<(), SinkError> {
        info!(
            target: "panewatch::trigger",
            sink = %event.sink_id,
            rule = %event.rule_id,
            pane = %event.pane,
            context = %event.context,
            "{}",
            event.reason
        );
        Ok(())
    }
}

type SharedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// One output stream shared by every producer of JSON lines. A line is
/// written and flushed under a single lock, so lines from different
/// producers never interleave.
#[derive(Clone)]
pub struct LineWriter {
    inner: Arc<Mutex<SharedWrite>>,
}

impl LineWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Appends the newline itself.
    pub async fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(line).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    /// Serializes `value` as one line.
    pub async fn write_json<T: serde::Serialize>(&self, value: &T) -> Result<(), SinkError> {
        let encoded = serde_json::to_vec(value)?;
        self.write_line(&encoded).await?;
        Ok(())
    }
}

impl fmt::Debug for LineWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineWriter").finish_non_exhaustive()
    }
}

/// Writes one JSON document per trigger event.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    id: String,
    writer: LineWriter,
}

impl JsonLinesSink {
    pub fn new(id: impl Into<String>, writer: LineWriter) -> Self {
        Self {
            id: id.into(),
            writer,
        }
    }
}

#[async_trait]
impl TriggerSink for JsonLinesSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &TriggerEvent) -> Result<(), SinkError> {
        self.writer.write_json(event).await
    }
}
