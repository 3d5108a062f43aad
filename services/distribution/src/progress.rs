//! Pull progress reporting.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Where a blob (or the pull as a whole) is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Resolving,
    Waiting,
    Downloading,
    Verifying,
    Complete,
    AlreadyExists,
    /// Free-form status line not tied to a blob.
    Status,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Resolving => "Resolving",
            Phase::Waiting => "Waiting",
            Phase::Downloading => "Downloading",
            Phase::Verifying => "Verifying Checksum",
            Phase::Complete => "Pull complete",
            Phase::AlreadyExists => "Already exists",
            Phase::Status => "Status",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Short blob identifier, or the reference for pull-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub phase: Phase,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self {
            id: None,
            phase: Phase::Status,
            message: message.into(),
            current: None,
            total: None,
        }
    }

    pub fn blob(id: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: Some(id.into()),
            phase,
            message: String::new(),
            current: None,
            total: None,
        }
    }

    pub fn with_progress(mut self, current: u64, total: Option<u64>) -> Self {
        self.current = Some(current);
        self.total = total;
        self
    }

    pub fn trying_to_pull(repository: &str) -> Self {
        Self::status(format!("Trying to pull repository {} ...", repository))
    }

    pub fn digest(digest: &dray_digest::Digest) -> Self {
        Self::status(format!("Digest: {}", digest))
    }

    /// Terminal status line for a successful pull.
    pub fn finished(reference: &str, downloaded: bool) -> Self {
        if downloaded {
            Self::status(format!("Status: Downloaded newer image for {}", reference))
        } else {
            Self::status(format!("Status: Image is up to date for {}", reference))
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, self.phase) {
            (None, _) => f.write_str(&self.message),
            (Some(id), phase) => {
                write!(f, "{}: {}", id, phase)?;
                if let Some(current) = self.current {
                    match self.total {
                        Some(total) => write!(f, " {}/{}", current, total)?,
                        None => write!(f, " {}", current)?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// Receives progress events. Must never block the pull.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Logs events at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: ProgressEvent) {
        debug!(id = ?event.id, phase = ?event.phase, "{}", event);
    }
}

/// Forwards events to a channel. Events sent after the receiver is dropped
/// are discarded.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}
