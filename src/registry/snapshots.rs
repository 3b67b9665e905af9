//! Snapshot repository

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::models::{Snapshot, SnapshotKind};
use crate::db::Db;
use crate::types::{HelmsmanError, Result, TimestampMs};

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Snapshot>>;

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Snapshot>>;

    /// Live snapshots whose expiry has passed
    async fn list_expired(&self, now: TimestampMs) -> Result<Vec<Snapshot>>;

    /// Soft-deleted snapshots older than the retention cutoff
    async fn list_purgeable(&self, cutoff: TimestampMs) -> Result<Vec<Snapshot>>;

    async fn soft_delete(&self, id: &str, now: TimestampMs) -> Result<()>;

    async fn hard_delete(&self, id: &str) -> Result<()>;
}

// =============================================================================
// SQLite implementation
// =============================================================================

pub struct SqliteSnapshotRepository {
    db: Db,
}

impl SqliteSnapshotRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

const SNAP_COLUMNS: &str = "id, tenant_id, instance_id, kind, storage_path, remote_key, \
     size_bytes, created_at, expires_at, deleted_at";

type SnapRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

fn read_snap_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SnapRow> {
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
    ))
}

fn snap_from_row(row: SnapRow) -> Result<Snapshot> {
    Ok(Snapshot {
        id: row.0,
        tenant_id: row.1,
        instance_id: row.2,
        kind: SnapshotKind::parse(&row.3)?,
        storage_path: row.4,
        remote_key: row.5,
        size_bytes: row.6.max(0) as u64,
        created_at: row.7,
        expires_at: row.8,
        deleted_at: row.9,
    })
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let s = snapshot.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO snapshots (id, tenant_id, instance_id, kind, storage_path, \
                     remote_key, size_bytes, created_at, expires_at, deleted_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        s.id,
                        s.tenant_id,
                        s.instance_id,
                        s.kind.as_str(),
                        s.storage_path,
                        s.remote_key,
                        s.size_bytes as i64,
                        s.created_at,
                        s.expires_at,
                        s.deleted_at
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM snapshots WHERE id = ?1", SNAP_COLUMNS),
                    params![id],
                    read_snap_row,
                )
                .optional()?
                .map(snap_from_row)
                .transpose()
            })
            .await
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Snapshot>> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM snapshots WHERE tenant_id = ?1 ORDER BY created_at DESC",
                    SNAP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![tenant_id], read_snap_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(snap_from_row).collect()
            })
            .await
    }

    async fn list_expired(&self, now: TimestampMs) -> Result<Vec<Snapshot>> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM snapshots WHERE deleted_at IS NULL \
                     AND expires_at IS NOT NULL AND expires_at < ?1 ORDER BY id",
                    SNAP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![now], read_snap_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(snap_from_row).collect()
            })
            .await
    }

    async fn list_purgeable(&self, cutoff: TimestampMs) -> Result<Vec<Snapshot>> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM snapshots WHERE deleted_at IS NOT NULL \
                     AND deleted_at < ?1 ORDER BY id",
                    SNAP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![cutoff], read_snap_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(snap_from_row).collect()
            })
            .await
    }

    async fn soft_delete(&self, id: &str, now: TimestampMs) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE snapshots SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                    params![id, now],
                )?;
                if changed == 0 {
                    return Err(HelmsmanError::NotFound(format!("snapshot {}", id)));
                }
                Ok(())
            })
            .await
    }

    async fn hard_delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
pub struct MemorySnapshotRepository {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl MemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRepository for MemorySnapshotRepository {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots
            .lock()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.lock().await.get(id).cloned())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Snapshot>> {
        let mut snaps: Vec<Snapshot> = self
            .snapshots
            .lock()
            .await
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        snaps.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(snaps)
    }

    async fn list_expired(&self, now: TimestampMs) -> Result<Vec<Snapshot>> {
        let mut snaps: Vec<Snapshot> = self
            .snapshots
            .lock()
            .await
            .values()
            .filter(|s| s.deleted_at.is_none() && s.expires_at.is_some_and(|e| e < now))
            .cloned()
            .collect();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snaps)
    }

    async fn list_purgeable(&self, cutoff: TimestampMs) -> Result<Vec<Snapshot>> {
        let mut snaps: Vec<Snapshot> = self
            .snapshots
            .lock()
            .await
            .values()
            .filter(|s| s.deleted_at.is_some_and(|d| d < cutoff))
            .cloned()
            .collect();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snaps)
    }

    async fn soft_delete(&self, id: &str, now: TimestampMs) -> Result<()> {
        let mut snaps = self.snapshots.lock().await;
        let snap = snaps
            .get_mut(id)
            .ok_or_else(|| HelmsmanError::NotFound(format!("snapshot {}", id)))?;
        if snap.deleted_at.is_none() {
            snap.deleted_at = Some(now);
        }
        Ok(())
    }

    async fn hard_delete(&self, id: &str) -> Result<()> {
        self.snapshots.lock().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str, expires: Option<i64>) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            instance_id: "b1".to_string(),
            kind: SnapshotKind::OnDemand,
            storage_path: format!("/backups/{}.tar.gz", id),
            remote_key: Some(format!("on-demand/t1/{}.tar.gz", id)),
            size_bytes: 1024,
            created_at: 1_000,
            expires_at: expires,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_retention_queries() {
        let db = Db::open_in_memory().unwrap();
        let repo = SqliteSnapshotRepository::new(db);
        repo.insert(&snap("s1", Some(5_000))).await.unwrap();
        repo.insert(&snap("s2", None)).await.unwrap();

        // s1 expires, s2 never does
        let expired = repo.list_expired(6_000).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "s1");

        repo.soft_delete("s1", 6_000).await.unwrap();
        assert!(repo.list_expired(7_000).await.unwrap().is_empty());

        assert!(repo.list_purgeable(6_000).await.unwrap().is_empty());
        let purgeable = repo.list_purgeable(6_001).await.unwrap();
        assert_eq!(purgeable.len(), 1);

        repo.hard_delete("s1").await.unwrap();
        assert!(repo.get("s1").await.unwrap().is_none());
    }
}
