//! Notification dispatch
//!
//! Billing and topup enqueue durable rows; this sweeper drains them through
//! a `Notifier`. Real delivery (email, webhooks) lives outside the core;
//! the in-tree notifier writes structured log lines.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::registry::{Notification, NotificationRepository};
use crate::types::{Clock, Result};

/// Delivery sink, specified by interface only
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Tracing-backed notifier
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            tenant_id = %notification.tenant_id,
            kind = %notification.kind,
            body = %notification.body,
            "Notification"
        );
        Ok(())
    }
}

/// Batch size per sweep
const DISPATCH_BATCH: usize = 100;

pub struct NotificationDispatcher {
    repo: Arc<dyn NotificationRepository>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            notifier,
            clock,
        }
    }

    /// Drain one batch. Failed deliveries stay queued for the next sweep.
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.repo.pending(DISPATCH_BATCH).await?;
        let mut sent = 0;
        for notification in pending {
            match self.notifier.deliver(&notification).await {
                Ok(()) => {
                    self.repo
                        .mark_sent(&notification.id, self.clock.now_ms())
                        .await?;
                    sent += 1;
                }
                Err(e) => {
                    warn!(
                        notification_id = %notification.id,
                        tenant_id = %notification.tenant_id,
                        error = %e,
                        "Notification delivery failed; will retry"
                    );
                }
            }
        }
        Ok(sent)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Notification sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryNotificationRepository;
    use crate::types::ManualClock;

    #[tokio::test]
    async fn test_dispatch_marks_sent() {
        let repo = Arc::new(MemoryNotificationRepository::new());
        repo.enqueue(&Notification {
            id: "n1".to_string(),
            tenant_id: "t1".to_string(),
            kind: "suspension".to_string(),
            body: "suspended".to_string(),
            created_at: 100,
            sent_at: None,
        })
        .await
        .unwrap();

        let dispatcher =
            NotificationDispatcher::new(repo.clone(), Arc::new(LogNotifier), ManualClock::new(200));
        assert_eq!(dispatcher.run_once().await.unwrap(), 1);
        assert!(repo.pending(10).await.unwrap().is_empty());
        // Idempotent second sweep
        assert_eq!(dispatcher.run_once().await.unwrap(), 0);
    }
}
