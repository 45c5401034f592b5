//! Operator notifications.
//!
//! The trading core never awaits a notifier: it pushes onto an unbounded
//! channel and a dispatcher task delivers in the background. A failed
//! delivery is logged and dropped.

mod telegram;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use telegram::{TelegramConfig, TelegramNotifier};

/// Notification category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Open,
    Close,
    /// Unprotected exposure or a failed emergency action
    Critical,
    /// Local state corrected from exchange truth
    Drift,
    Info,
}

impl NotificationKind {
    pub fn emoji(self) -> &'static str {
        match self {
            NotificationKind::Open => "🟢",
            NotificationKind::Close => "🔴",
            NotificationKind::Critical => "🚨",
            NotificationKind::Drift => "⚠️",
            NotificationKind::Info => "ℹ️",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::Open => "OPEN",
            NotificationKind::Close => "CLOSE",
            NotificationKind::Critical => "CRITICAL",
            NotificationKind::Drift => "DRIFT",
            NotificationKind::Info => "INFO",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Delivery backend.
pub trait Notifier: Send + Sync {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Writes notifications to the log. Used when no chat channel is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            match notification.kind {
                NotificationKind::Critical => {
                    error!(kind = %notification.kind, "{}", notification.message)
                }
                NotificationKind::Drift => {
                    warn!(kind = %notification.kind, "{}", notification.message)
                }
                _ => info!(kind = %notification.kind, "{}", notification.message),
            }
            Ok(())
        })
    }
}

/// Spawn the delivery task. It exits once every sender is dropped and the
/// queue is drained.
pub fn spawn_dispatcher(
    notifier: Arc<dyn Notifier>,
    mut rx: mpsc::UnboundedReceiver<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(e) = notifier.send(&notification).await {
                warn!(kind = %notification.kind, error = %e, "Notification delivery failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<Notification>>,
        fail: bool,
    }

    impl Notifier for Collecting {
        fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(notification.clone());
                if self.fail {
                    anyhow::bail!("chat unreachable");
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_dispatcher_drains_queue() {
        let notifier = Arc::new(Collecting::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_dispatcher(notifier.clone(), rx);

        tx.send(Notification::new(NotificationKind::Open, "a")).unwrap();
        tx.send(Notification::new(NotificationKind::Close, "b")).unwrap();
        drop(tx);
        handle.await.unwrap();

        let seen = notifier.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].kind, NotificationKind::Close);
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_stop_dispatch() {
        let notifier = Arc::new(Collecting {
            fail: true,
            ..Default::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_dispatcher(notifier.clone(), rx);

        for i in 0..3 {
            tx.send(Notification::new(NotificationKind::Info, i.to_string())).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(notifier.seen.lock().unwrap().len(), 3);
    }
}
