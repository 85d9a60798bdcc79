//! Status event surface.
//!
//! The core owns no presentation logic. Every noteworthy transition or failure is
//! published as a timestamped, severity-tagged [`StatusEvent`] on a broadcast
//! channel that any front end may subscribe to, and mirrored into `tracing` so
//! headless runs keep a log.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Event channel capacity; slow listeners lag instead of blocking the core.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How serious a status event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Normal progress (window opened, file written).
    Info,
    /// Degraded but continuing (pulse skipped, empty window).
    Warning,
    /// Failure of a job or subsystem.
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A single status message for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Wall-clock time the event was raised
    pub timestamp: DateTime<Local>,
    /// Severity tag
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {:5} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.severity,
            self.message
        )
    }
}

/// Cloneable publisher for status events.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventSink {
    /// Create a new event sink with no listeners.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event with the given severity.
    pub fn emit(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => info!(target: "calcium_daq::status", "{}", message),
            Severity::Warning => warn!(target: "calcium_daq::status", "{}", message),
            Severity::Error => error!(target: "calcium_daq::status", "{}", message),
        }
        // No listeners is fine: the tracing mirror above still records it.
        let _ = self.tx.send(StatusEvent {
            timestamp: Local::now(),
            severity,
            message,
        });
    }

    /// Publish an informational event.
    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message);
    }

    /// Publish a warning event.
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(Severity::Warning, message);
    }

    /// Publish an error event.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every event currently buffered on a receiver.
///
/// Handy for tests and for front ends that poll on a UI timer.
pub fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}
