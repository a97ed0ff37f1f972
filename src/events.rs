//! Lifecycle notifications for sync invocations
//!
//! Observers learn that a mailbox sync started and, only when it succeeded,
//! that it finished. Delivery problems are logged and never fail a run.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::models::{Mailbox, SyncContext};

/// Lifecycle event kind, serialized under its channel name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncEventKind {
    #[serde(rename = "message-worker-start")]
    Start,
    #[serde(rename = "message-worker-finish")]
    Finish,
}

impl SyncEventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "message-worker-start",
            Self::Finish => "message-worker-finish",
        }
    }
}

/// Event addressed to the mailbox owner
#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub event: SyncEventKind,
    pub user_id: String,
    pub mailbox: Mailbox,
}

impl SyncEvent {
    pub fn new(event: SyncEventKind, ctx: &SyncContext) -> Self {
        Self {
            event,
            user_id: ctx.user_id.clone(),
            mailbox: ctx.mailbox.clone(),
        }
    }
}

/// Receiver of lifecycle events
pub trait EventPublisher {
    fn publish(&self, event: &SyncEvent);
}

/// Publishes events as log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: &SyncEvent) {
        info!(
            event = event.event.name(),
            user_id = %event.user_id,
            mailbox_id = %event.mailbox.id,
            mailbox = %event.mailbox.name,
            "sync event"
        );
    }
}

/// Publishes one JSON object per line to a writer
#[derive(Debug)]
pub struct JsonLinesPublisher<W: Write> {
    writer: Mutex<W>,
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_event(&self, event: &SyncEvent) -> Result<(), String> {
        let line = serde_json::to_string(event).map_err(|e| e.to_string())?;
        let mut writer = self.writer.lock().map_err(|_| "writer lock poisoned".to_owned())?;
        writeln!(writer, "{line}")
            .and_then(|()| writer.flush())
            .map_err(|e| e.to_string())
    }
}

impl<W: Write> EventPublisher for JsonLinesPublisher<W> {
    fn publish(&self, event: &SyncEvent) {
        if let Err(error) = self.write_event(event) {
            warn!(
                event = event.event.name(),
                mailbox_id = %event.mailbox.id,
                error = %error,
                "failed to publish sync event"
            );
        }
    }
}
