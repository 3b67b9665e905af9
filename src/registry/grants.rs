//! Undoable bulk-grant repository

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::models::{UndoStatus, UndoableGrant};
use crate::db::Db;
use crate::types::{HelmsmanError, Result};

#[async_trait]
pub trait UndoGrantRepository: Send + Sync {
    async fn insert(&self, grant: &UndoableGrant) -> Result<()>;

    async fn get(&self, operation_id: &str) -> Result<Option<UndoableGrant>>;

    async fn set_undo_status(
        &self,
        operation_id: &str,
        status: UndoStatus,
        failed_ids: &[String],
    ) -> Result<()>;
}

pub struct SqliteUndoGrantRepository {
    db: Db,
}

impl SqliteUndoGrantRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UndoGrantRepository for SqliteUndoGrantRepository {
    async fn insert(&self, grant: &UndoableGrant) -> Result<()> {
        let g = grant.clone();
        self.db
            .with(move |conn| {
                let tenant_ids = serde_json::to_string(&g.tenant_ids)?;
                let failed_ids = serde_json::to_string(&g.failed_ids)?;
                conn.execute(
                    "INSERT INTO bulk_undo_grants (operation_id, tenant_ids, amount_cents, \
                     deadline, undo_status, failed_ids, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        g.operation_id,
                        tenant_ids,
                        g.amount_cents,
                        g.deadline,
                        g.undo_status.as_str(),
                        failed_ids,
                        g.created_at
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, operation_id: &str) -> Result<Option<UndoableGrant>> {
        let operation_id = operation_id.to_string();
        self.db
            .with(move |conn| {
                let row: Option<(String, String, i64, i64, String, Option<String>, i64)> = conn
                    .query_row(
                        "SELECT operation_id, tenant_ids, amount_cents, deadline, undo_status, \
                         failed_ids, created_at FROM bulk_undo_grants WHERE operation_id = ?1",
                        params![operation_id],
                        |r| {
                            Ok((
                                r.get(0)?,
                                r.get(1)?,
                                r.get(2)?,
                                r.get(3)?,
                                r.get(4)?,
                                r.get(5)?,
                                r.get(6)?,
                            ))
                        },
                    )
                    .optional()?;
                row.map(|row| {
                    let tenant_ids: Vec<String> = serde_json::from_str(&row.1)?;
                    let failed_ids: Vec<String> = row
                        .5
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?
                        .unwrap_or_default();
                    Ok(UndoableGrant {
                        operation_id: row.0,
                        tenant_ids,
                        amount_cents: row.2,
                        deadline: row.3,
                        undo_status: UndoStatus::parse(&row.4)?,
                        failed_ids,
                        created_at: row.6,
                    })
                })
                .transpose()
            })
            .await
    }

    async fn set_undo_status(
        &self,
        operation_id: &str,
        status: UndoStatus,
        failed_ids: &[String],
    ) -> Result<()> {
        let operation_id = operation_id.to_string();
        let failed_ids = serde_json::to_string(failed_ids)?;
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE bulk_undo_grants SET undo_status = ?2, failed_ids = ?3 \
                     WHERE operation_id = ?1",
                    params![operation_id, status.as_str(), failed_ids],
                )?;
                if changed == 0 {
                    return Err(HelmsmanError::NotFound(format!(
                        "bulk operation {}",
                        operation_id
                    )));
                }
                Ok(())
            })
            .await
    }
}

#[derive(Default)]
pub struct MemoryUndoGrantRepository {
    grants: Mutex<HashMap<String, UndoableGrant>>,
}

impl MemoryUndoGrantRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UndoGrantRepository for MemoryUndoGrantRepository {
    async fn insert(&self, grant: &UndoableGrant) -> Result<()> {
        self.grants
            .lock()
            .await
            .insert(grant.operation_id.clone(), grant.clone());
        Ok(())
    }

    async fn get(&self, operation_id: &str) -> Result<Option<UndoableGrant>> {
        Ok(self.grants.lock().await.get(operation_id).cloned())
    }

    async fn set_undo_status(
        &self,
        operation_id: &str,
        status: UndoStatus,
        failed_ids: &[String],
    ) -> Result<()> {
        let mut grants = self.grants.lock().await;
        let grant = grants.get_mut(operation_id).ok_or_else(|| {
            HelmsmanError::NotFound(format!("bulk operation {}", operation_id))
        })?;
        grant.undo_status = status;
        grant.failed_ids = failed_ids.to_vec();
        Ok(())
    }
}
