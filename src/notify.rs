//! Toast-style notifications emitted after load and save attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub emitted_at: DateTime<Utc>,
}

impl Notification {
    pub fn success(message: &str) -> Self {
        Self::new("Success", message, Severity::Success)
    }

    pub fn error(message: &str) -> Self {
        Self::new("Error", message, Severity::Error)
    }

    pub fn new(title: &str, message: &str, severity: Severity) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            severity,
            emitted_at: Utc::now(),
        }
    }
}

/// Fire-and-forget presentation of a notification
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    fn notify(&self, notification: Notification) {
        (**self).notify(notification)
    }
}

/// Writes notifications to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Success => info!(title = %notification.title, "{}", notification.message),
            Severity::Error => error!(title = %notification.title, "{}", notification.message),
        }
    }
}

/// Keeps notifications in memory so a host can hand them to its own UI
#[derive(Debug, Clone, Default)]
pub struct CollectingNotifier {
    inner: Arc<Mutex<Vec<Notification>>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Take everything collected so far
    pub fn drain(&self) -> Vec<Notification> {
        self.inner
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<Notification> {
        self.inner.lock().ok().and_then(|v| v.last().cloned())
    }
}

impl NotificationSink for CollectingNotifier {
    fn notify(&self, notification: Notification) {
        if let Ok(mut list) = self.inner.lock() {
            list.push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_notifier() {
        let sink = CollectingNotifier::new();
        let shared = sink.clone();

        sink.notify(Notification::success("Changes saved successfully"));
        shared.notify(Notification::error("Insufficient funds"));

        assert_eq!(sink.snapshot().len(), 2);
        assert_eq!(sink.last().map(|n| n.severity), Some(Severity::Error));

        let drained = shared.drain();
        assert_eq!(drained[0].title, "Success");
        assert_eq!(drained[1].message, "Insufficient funds");
        assert!(sink.snapshot().is_empty());
    }
}
