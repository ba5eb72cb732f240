//! User-facing notifications.

use serde::{Deserialize, Serialize};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Informational.
    Info,
    /// Something finished well.
    Success,
    /// Needs attention, not fatal.
    Warning,
    /// Something failed.
    Error,
}

/// A message for the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Severity.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Body text.
    pub message: String,
    /// Title.
    pub title: String,
    /// How long to show it; 0 keeps it until dismissed.
    pub duration_ms: u64,
}

impl Notification {
    /// Creates a notification with a 4 second duration.
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            title: title.into(),
            duration_ms: 4000,
        }
    }

    /// Creates an info notification.
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, title, message)
    }

    /// Creates a success notification.
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Success, title, message)
    }

    /// Creates a warning notification.
    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Warning, title, message)
    }

    /// Creates an error notification (5 seconds).
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, title, message).with_duration(5000)
    }

    /// Sets the display duration.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
