//! Durable notification queue

use async_trait::async_trait;
use rusqlite::params;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::models::Notification;
use crate::db::Db;
use crate::types::{Result, TimestampMs};

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn enqueue(&self, notification: &Notification) -> Result<()>;

    async fn pending(&self, limit: usize) -> Result<Vec<Notification>>;

    async fn mark_sent(&self, id: &str, now: TimestampMs) -> Result<()>;
}

pub struct SqliteNotificationRepository {
    db: Db,
}

impl SqliteNotificationRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotificationRepository for SqliteNotificationRepository {
    async fn enqueue(&self, notification: &Notification) -> Result<()> {
        let n = notification.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO notification_queue (id, tenant_id, kind, body, created_at, \
                     sent_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![n.id, n.tenant_id, n.kind, n.body, n.created_at, n.sent_at],
                )?;
                Ok(())
            })
            .await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Notification>> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant_id, kind, body, created_at, sent_at \
                     FROM notification_queue WHERE sent_at IS NULL \
                     ORDER BY created_at LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], |r| {
                        Ok(Notification {
                            id: r.get(0)?,
                            tenant_id: r.get(1)?,
                            kind: r.get(2)?,
                            body: r.get(3)?,
                            created_at: r.get(4)?,
                            sent_at: r.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    async fn mark_sent(&self, id: &str, now: TimestampMs) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE notification_queue SET sent_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(())
            })
            .await
    }
}

#[derive(Default)]
pub struct MemoryNotificationRepository {
    queue: Mutex<HashMap<String, Notification>>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn enqueue(&self, notification: &Notification) -> Result<()> {
        self.queue
            .lock()
            .await
            .insert(notification.id.clone(), notification.clone());
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Notification>> {
        let mut pending: Vec<Notification> = self
            .queue
            .lock()
            .await
            .values()
            .filter(|n| n.sent_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|n| n.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_sent(&self, id: &str, now: TimestampMs) -> Result<()> {
        if let Some(n) = self.queue.lock().await.get_mut(id) {
            n.sent_at = Some(now);
        }
        Ok(())
    }
}
