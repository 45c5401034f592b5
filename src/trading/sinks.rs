//! Fire-and-forget outputs of the trading core.

use tokio::sync::mpsc;
use tracing::warn;

use crate::models::TransitionRecord;
use crate::notify::{Notification, NotificationKind};

/// Channels to the notification dispatcher and the record writer.
/// Sending never blocks and never fails the caller.
#[derive(Debug, Clone)]
pub struct Sinks {
    notifications: mpsc::UnboundedSender<Notification>,
    records: mpsc::UnboundedSender<TransitionRecord>,
}

impl Sinks {
    pub fn new(
        notifications: mpsc::UnboundedSender<Notification>,
        records: mpsc::UnboundedSender<TransitionRecord>,
    ) -> Self {
        Self {
            notifications,
            records,
        }
    }

    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>) {
        if self.notifications.send(Notification::new(kind, message)).is_err() {
            warn!(%kind, "Notification channel closed, dropping notification");
        }
    }

    pub fn record(&self, record: TransitionRecord) {
        if let Err(e) = self.records.send(record) {
            warn!(event_id = %e.0.event_id, action = %e.0.action, "Record channel closed, dropping record");
        }
    }
}
