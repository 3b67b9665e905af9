//! Recovery event/item repository
//!
//! The recovery log is both an audit trail and coordination state: an
//! `in_progress` event blocks a second recovery of the same node, and a
//! node re-registration closes any open event for it.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::models::{
    RecoveryEvent, RecoveryItem, RecoveryItemStatus, RecoveryStatus, RecoveryTrigger,
};
use crate::db::Db;
use crate::types::{HelmsmanError, Result, TimestampMs};

/// Counter snapshot written when an event is finalized or updated
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryCounters {
    pub total: u32,
    pub recovered: u32,
    pub failed: u32,
    pub waiting: u32,
}

#[async_trait]
pub trait RecoveryLogRepository: Send + Sync {
    async fn create_event(&self, event: &RecoveryEvent) -> Result<()>;

    async fn get_event(&self, id: &str) -> Result<Option<RecoveryEvent>>;

    /// The in-flight event for a node, if any
    async fn open_event_for_node(&self, node_id: &str) -> Result<Option<RecoveryEvent>>;

    /// Stamp final status, counters, completion time and report
    async fn finalize_event(
        &self,
        id: &str,
        status: RecoveryStatus,
        counters: RecoveryCounters,
        completed_at: Option<TimestampMs>,
        report: Option<String>,
    ) -> Result<()>;

    /// Close any in-flight events for a re-registered node. Returns how many
    /// events were closed.
    async fn close_open_for_node(&self, node_id: &str, now: TimestampMs) -> Result<usize>;

    async fn add_item(&self, item: &RecoveryItem) -> Result<()>;

    async fn update_item(
        &self,
        id: &str,
        target_node: Option<&str>,
        status: RecoveryItemStatus,
        reason: Option<&str>,
        now: TimestampMs,
    ) -> Result<()>;

    async fn list_items(&self, event_id: &str) -> Result<Vec<RecoveryItem>>;
}

// =============================================================================
// SQLite implementation
// =============================================================================

pub struct SqliteRecoveryLogRepository {
    db: Db,
}

impl SqliteRecoveryLogRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

const EVENT_COLUMNS: &str = "id, node_id, trigger_kind, status, total, recovered, failed, \
     waiting, started_at, completed_at, report";

type EventRow = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    Option<i64>,
    Option<String>,
);

fn read_event_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
        r.get(10)?,
    ))
}

fn event_from_row(row: EventRow) -> Result<RecoveryEvent> {
    Ok(RecoveryEvent {
        id: row.0,
        node_id: row.1,
        trigger: RecoveryTrigger::parse(&row.2)?,
        status: RecoveryStatus::parse(&row.3)?,
        total: row.4.max(0) as u32,
        recovered: row.5.max(0) as u32,
        failed: row.6.max(0) as u32,
        waiting: row.7.max(0) as u32,
        started_at: row.8,
        completed_at: row.9,
        report: row.10,
    })
}

const ITEM_COLUMNS: &str = "id, recovery_event_id, tenant_id, bot_id, source_node, \
     target_node, backup_key, status, reason, created_at, updated_at";

type ItemRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    i64,
    i64,
);

fn read_item_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
        r.get(10)?,
    ))
}

fn item_from_row(row: ItemRow) -> Result<RecoveryItem> {
    Ok(RecoveryItem {
        id: row.0,
        recovery_event_id: row.1,
        tenant_id: row.2,
        bot_id: row.3,
        source_node: row.4,
        target_node: row.5,
        backup_key: row.6,
        status: RecoveryItemStatus::parse(&row.7)?,
        reason: row.8,
        created_at: row.9,
        updated_at: row.10,
    })
}

#[async_trait]
impl RecoveryLogRepository for SqliteRecoveryLogRepository {
    async fn create_event(&self, event: &RecoveryEvent) -> Result<()> {
        let event = event.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO recovery_events (id, node_id, trigger_kind, status, total, \
                     recovered, failed, waiting, started_at, completed_at, report) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        event.id,
                        event.node_id,
                        event.trigger.as_str(),
                        event.status.as_str(),
                        event.total as i64,
                        event.recovered as i64,
                        event.failed as i64,
                        event.waiting as i64,
                        event.started_at,
                        event.completed_at,
                        event.report
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_event(&self, id: &str) -> Result<Option<RecoveryEvent>> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM recovery_events WHERE id = ?1", EVENT_COLUMNS),
                    params![id],
                    read_event_row,
                )
                .optional()?
                .map(event_from_row)
                .transpose()
            })
            .await
    }

    async fn open_event_for_node(&self, node_id: &str) -> Result<Option<RecoveryEvent>> {
        let node_id = node_id.to_string();
        self.db
            .with(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM recovery_events \
                         WHERE node_id = ?1 AND status = 'in_progress' \
                         ORDER BY started_at DESC LIMIT 1",
                        EVENT_COLUMNS
                    ),
                    params![node_id],
                    read_event_row,
                )
                .optional()?
                .map(event_from_row)
                .transpose()
            })
            .await
    }

    async fn finalize_event(
        &self,
        id: &str,
        status: RecoveryStatus,
        counters: RecoveryCounters,
        completed_at: Option<TimestampMs>,
        report: Option<String>,
    ) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE recovery_events SET status = ?2, total = ?3, recovered = ?4, \
                     failed = ?5, waiting = ?6, completed_at = ?7, report = ?8 WHERE id = ?1",
                    params![
                        id,
                        status.as_str(),
                        counters.total as i64,
                        counters.recovered as i64,
                        counters.failed as i64,
                        counters.waiting as i64,
                        completed_at,
                        report
                    ],
                )?;
                if changed == 0 {
                    return Err(HelmsmanError::NotFound(format!("recovery event {}", id)));
                }
                Ok(())
            })
            .await
    }

    async fn close_open_for_node(&self, node_id: &str, now: TimestampMs) -> Result<usize> {
        let node_id = node_id.to_string();
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE recovery_events SET status = 'completed', completed_at = ?2 \
                     WHERE node_id = ?1 AND status = 'in_progress'",
                    params![node_id, now],
                )?;
                Ok(changed)
            })
            .await
    }

    async fn add_item(&self, item: &RecoveryItem) -> Result<()> {
        let item = item.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO recovery_items (id, recovery_event_id, tenant_id, bot_id, \
                     source_node, target_node, backup_key, status, reason, created_at, \
                     updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        item.id,
                        item.recovery_event_id,
                        item.tenant_id,
                        item.bot_id,
                        item.source_node,
                        item.target_node,
                        item.backup_key,
                        item.status.as_str(),
                        item.reason,
                        item.created_at,
                        item.updated_at
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn update_item(
        &self,
        id: &str,
        target_node: Option<&str>,
        status: RecoveryItemStatus,
        reason: Option<&str>,
        now: TimestampMs,
    ) -> Result<()> {
        let id = id.to_string();
        let target_node = target_node.map(|s| s.to_string());
        let reason = reason.map(|s| s.to_string());
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE recovery_items SET target_node = ?2, status = ?3, reason = ?4, \
                     updated_at = ?5 WHERE id = ?1",
                    params![id, target_node, status.as_str(), reason, now],
                )?;
                if changed == 0 {
                    return Err(HelmsmanError::NotFound(format!("recovery item {}", id)));
                }
                Ok(())
            })
            .await
    }

    async fn list_items(&self, event_id: &str) -> Result<Vec<RecoveryItem>> {
        let event_id = event_id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM recovery_items WHERE recovery_event_id = ?1 ORDER BY id",
                    ITEM_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![event_id], read_item_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(item_from_row).collect()
            })
            .await
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
pub struct MemoryRecoveryLogRepository {
    events: Mutex<HashMap<String, RecoveryEvent>>,
    items: Mutex<HashMap<String, RecoveryItem>>,
}

impl MemoryRecoveryLogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryLogRepository for MemoryRecoveryLogRepository {
    async fn create_event(&self, event: &RecoveryEvent) -> Result<()> {
        self.events
            .lock()
            .await
            .insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get_event(&self, id: &str) -> Result<Option<RecoveryEvent>> {
        Ok(self.events.lock().await.get(id).cloned())
    }

    async fn open_event_for_node(&self, node_id: &str) -> Result<Option<RecoveryEvent>> {
        Ok(self
            .events
            .lock()
            .await
            .values()
            .filter(|e| e.node_id == node_id && e.status == RecoveryStatus::InProgress)
            .max_by_key(|e| e.started_at)
            .cloned())
    }

    async fn finalize_event(
        &self,
        id: &str,
        status: RecoveryStatus,
        counters: RecoveryCounters,
        completed_at: Option<TimestampMs>,
        report: Option<String>,
    ) -> Result<()> {
        let mut events = self.events.lock().await;
        let event = events
            .get_mut(id)
            .ok_or_else(|| HelmsmanError::NotFound(format!("recovery event {}", id)))?;
        event.status = status;
        event.total = counters.total;
        event.recovered = counters.recovered;
        event.failed = counters.failed;
        event.waiting = counters.waiting;
        event.completed_at = completed_at;
        event.report = report;
        Ok(())
    }

    async fn close_open_for_node(&self, node_id: &str, now: TimestampMs) -> Result<usize> {
        let mut events = self.events.lock().await;
        let mut closed = 0;
        for event in events.values_mut() {
            if event.node_id == node_id && event.status == RecoveryStatus::InProgress {
                event.status = RecoveryStatus::Completed;
                event.completed_at = Some(now);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn add_item(&self, item: &RecoveryItem) -> Result<()> {
        self.items.lock().await.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn update_item(
        &self,
        id: &str,
        target_node: Option<&str>,
        status: RecoveryItemStatus,
        reason: Option<&str>,
        now: TimestampMs,
    ) -> Result<()> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| HelmsmanError::NotFound(format!("recovery item {}", id)))?;
        item.target_node = target_node.map(|s| s.to_string());
        item.status = status;
        item.reason = reason.map(|s| s.to_string());
        item.updated_at = now;
        Ok(())
    }

    async fn list_items(&self, event_id: &str) -> Result<Vec<RecoveryItem>> {
        let mut items: Vec<RecoveryItem> = self
            .items
            .lock()
            .await
            .values()
            .filter(|i| i.recovery_event_id == event_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }
}
