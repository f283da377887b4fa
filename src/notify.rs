//! Host-facing notification and overlay payloads.
//!
//! The toast surface and the violation overlay are external collaborators —
//! this module defines only the payloads they receive and a broadcast-based
//! default sink the host can subscribe to.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Severity of a notification, mirroring the host's toast kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
    Success,
}

/// Optional action attached to a notification (e.g. a "view quota" button).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub label: String,
    pub action_id: String,
}

/// A single toast for the host notification surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub duration_ms: u64,
    pub action: Option<NotificationAction>,
}

impl Notification {
    pub fn warning(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            kind: NotificationKind::Warning,
            message: message.into(),
            duration_ms,
            action: None,
        }
    }

    pub fn error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: message.into(),
            duration_ms,
            action: None,
        }
    }
}

/// Receives notifications destined for the host toast surface.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Broadcasts notifications to all subscribed host surfaces.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribe to all notifications. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

/// Sink that drops everything. For tests and headless admin commands.
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}

/// Payload for the external violation/grace overlay surface.
///
/// The host renders the overlay and wires its designated return input back to
/// [`crate::session::ExamSession::return_to_exam`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationOverlay {
    pub is_open: bool,
    pub message: String,
    pub grace_deadline: Option<DateTime<Utc>>,
}

impl ViolationOverlay {
    pub fn closed() -> Self {
        Self {
            is_open: false,
            message: String::new(),
            grace_deadline: None,
        }
    }
}
