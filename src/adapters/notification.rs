//! Operator notification sinks

use crate::domain::{Notification, Severity};
use async_trait::async_trait;
use std::sync::Mutex;

/// Destination for operator-facing events
///
/// Delivery is best effort: a sink must not fail the operation that raised
/// the event.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Emits notifications as structured log events
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, notification: Notification) {
        let payload = serde_json::to_string(&notification).unwrap_or_default();
        match notification.severity() {
            Severity::Critical => {
                tracing::error!(notification = %payload, "{notification}")
            }
            Severity::Warning => tracing::warn!(notification = %payload, "{notification}"),
            Severity::Info => tracing::info!(notification = %payload, "{notification}"),
        }
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of received notifications
    pub fn events(&self) -> Vec<Notification> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        if let Ok(mut events) = self.events.lock() {
            events.push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PatientId;

    #[tokio::test]
    async fn test_recording_notifier_keeps_order() {
        let sink = RecordingNotifier::new();
        for id in ["a", "b"] {
            sink.notify(Notification::PatientNotFound {
                patient_id: PatientId::new(id).unwrap(),
            })
            .await;
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            Notification::PatientNotFound { patient_id } if patient_id.as_str() == "b"
        ));
    }

    #[tokio::test]
    async fn test_tracing_notifier_does_not_panic() {
        TracingNotifier
            .notify(Notification::PatientNotFound {
                patient_id: PatientId::new("a").unwrap(),
            })
            .await;
    }
}
