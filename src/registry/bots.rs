//! Bot-instance repository
//!
//! Tenant workloads and their node assignment. `(tenant_id, name)` is unique;
//! a violation surfaces as a conflict, not a database error.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::models::{BillingState, BotInstance, ResourceTier};
use crate::db::Db;
use crate::types::{HelmsmanError, Result, TimestampMs};

#[async_trait]
pub trait BotInstanceRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<BotInstance>>;

    async fn list(&self) -> Result<Vec<BotInstance>>;

    async fn list_by_node(&self, node_id: &str) -> Result<Vec<BotInstance>>;

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<BotInstance>>;

    /// Insert a new workload; duplicate `(tenant_id, name)` is a conflict
    async fn insert(&self, bot: &BotInstance) -> Result<()>;

    async fn assign_node(
        &self,
        id: &str,
        node_id: Option<&str>,
        now: TimestampMs,
    ) -> Result<()>;

    async fn set_billing_state(
        &self,
        id: &str,
        state: BillingState,
        suspended_at: Option<TimestampMs>,
        destroy_after: Option<TimestampMs>,
        now: TimestampMs,
    ) -> Result<()>;

    /// Suspended workloads whose grace period has elapsed
    async fn list_suspended_expired(&self, now: TimestampMs) -> Result<Vec<BotInstance>>;
}

// =============================================================================
// SQLite implementation
// =============================================================================

pub struct SqliteBotInstanceRepository {
    db: Db,
}

impl SqliteBotInstanceRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

const BOT_COLUMNS: &str = "id, tenant_id, name, node_id, image, env, billing_state, \
     suspended_at, destroy_after, resource_tier, storage_tier, created_at, updated_at";

type BotRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<i64>,
    Option<i64>,
    String,
    String,
    i64,
    i64,
);

fn read_bot_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<BotRow> {
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
        r.get(11)?,
        r.get(12)?,
    ))
}

fn bot_from_row(row: BotRow) -> Result<BotInstance> {
    let env = serde_json::from_str(&row.5)
        .map_err(|e| HelmsmanError::Database(format!("bad env JSON for bot {}: {}", row.0, e)))?;
    Ok(BotInstance {
        id: row.0,
        tenant_id: row.1,
        name: row.2,
        node_id: row.3,
        image: row.4,
        env,
        billing_state: BillingState::parse(&row.6)?,
        suspended_at: row.7,
        destroy_after: row.8,
        resource_tier: ResourceTier::parse(&row.9)?,
        storage_tier: row.10,
        created_at: row.11,
        updated_at: row.12,
    })
}

fn map_unique_violation(err: rusqlite::Error, bot: &BotInstance) -> HelmsmanError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            HelmsmanError::Conflict(format!(
                "workload '{}' already exists for tenant {}",
                bot.name, bot.tenant_id
            ))
        }
        _ => err.into(),
    }
}

#[async_trait]
impl BotInstanceRepository for SqliteBotInstanceRepository {
    async fn get(&self, id: &str) -> Result<Option<BotInstance>> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM bot_instances WHERE id = ?1", BOT_COLUMNS),
                    params![id],
                    read_bot_row,
                )
                .optional()?
                .map(bot_from_row)
                .transpose()
            })
            .await
    }

    async fn list(&self) -> Result<Vec<BotInstance>> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM bot_instances ORDER BY id",
                    BOT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], read_bot_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(bot_from_row).collect()
            })
            .await
    }

    async fn list_by_node(&self, node_id: &str) -> Result<Vec<BotInstance>> {
        let node_id = node_id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM bot_instances WHERE node_id = ?1 ORDER BY id",
                    BOT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![node_id], read_bot_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(bot_from_row).collect()
            })
            .await
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<BotInstance>> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM bot_instances WHERE tenant_id = ?1 ORDER BY id",
                    BOT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![tenant_id], read_bot_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(bot_from_row).collect()
            })
            .await
    }

    async fn insert(&self, bot: &BotInstance) -> Result<()> {
        let bot = bot.clone();
        self.db
            .with(move |conn| {
                let env = serde_json::to_string(&bot.env)?;
                conn.execute(
                    "INSERT INTO bot_instances (id, tenant_id, name, node_id, image, env, \
                     billing_state, suspended_at, destroy_after, resource_tier, storage_tier, \
                     created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        bot.id,
                        bot.tenant_id,
                        bot.name,
                        bot.node_id,
                        bot.image,
                        env,
                        bot.billing_state.as_str(),
                        bot.suspended_at,
                        bot.destroy_after,
                        bot.resource_tier.as_str(),
                        bot.storage_tier,
                        bot.created_at,
                        bot.updated_at
                    ],
                )
                .map_err(|e| map_unique_violation(e, &bot))?;
                Ok(())
            })
            .await
    }

    async fn assign_node(
        &self,
        id: &str,
        node_id: Option<&str>,
        now: TimestampMs,
    ) -> Result<()> {
        let id = id.to_string();
        let node_id = node_id.map(|s| s.to_string());
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE bot_instances SET node_id = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, node_id, now],
                )?;
                if changed == 0 {
                    return Err(HelmsmanError::NotFound(format!("bot {}", id)));
                }
                Ok(())
            })
            .await
    }

    async fn set_billing_state(
        &self,
        id: &str,
        state: BillingState,
        suspended_at: Option<TimestampMs>,
        destroy_after: Option<TimestampMs>,
        now: TimestampMs,
    ) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE bot_instances SET billing_state = ?2, suspended_at = ?3, \
                     destroy_after = ?4, updated_at = ?5 WHERE id = ?1",
                    params![id, state.as_str(), suspended_at, destroy_after, now],
                )?;
                if changed == 0 {
                    return Err(HelmsmanError::NotFound(format!("bot {}", id)));
                }
                Ok(())
            })
            .await
    }

    async fn list_suspended_expired(&self, now: TimestampMs) -> Result<Vec<BotInstance>> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM bot_instances \
                     WHERE billing_state = 'suspended' AND destroy_after IS NOT NULL \
                     AND destroy_after < ?1 ORDER BY id",
                    BOT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![now], read_bot_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(bot_from_row).collect()
            })
            .await
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
pub struct MemoryBotInstanceRepository {
    bots: Mutex<HashMap<String, BotInstance>>,
}

impl MemoryBotInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BotInstanceRepository for MemoryBotInstanceRepository {
    async fn get(&self, id: &str) -> Result<Option<BotInstance>> {
        Ok(self.bots.lock().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<BotInstance>> {
        let mut bots: Vec<BotInstance> = self.bots.lock().await.values().cloned().collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }

    async fn list_by_node(&self, node_id: &str) -> Result<Vec<BotInstance>> {
        let mut bots: Vec<BotInstance> = self
            .bots
            .lock()
            .await
            .values()
            .filter(|b| b.node_id.as_deref() == Some(node_id))
            .cloned()
            .collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<BotInstance>> {
        let mut bots: Vec<BotInstance> = self
            .bots
            .lock()
            .await
            .values()
            .filter(|b| b.tenant_id == tenant_id)
            .cloned()
            .collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }

    async fn insert(&self, bot: &BotInstance) -> Result<()> {
        let mut bots = self.bots.lock().await;
        if bots
            .values()
            .any(|b| b.tenant_id == bot.tenant_id && b.name == bot.name)
        {
            return Err(HelmsmanError::Conflict(format!(
                "workload '{}' already exists for tenant {}",
                bot.name, bot.tenant_id
            )));
        }
        bots.insert(bot.id.clone(), bot.clone());
        Ok(())
    }

    async fn assign_node(
        &self,
        id: &str,
        node_id: Option<&str>,
        now: TimestampMs,
    ) -> Result<()> {
        let mut bots = self.bots.lock().await;
        let bot = bots
            .get_mut(id)
            .ok_or_else(|| HelmsmanError::NotFound(format!("bot {}", id)))?;
        bot.node_id = node_id.map(|s| s.to_string());
        bot.updated_at = now;
        Ok(())
    }

    async fn set_billing_state(
        &self,
        id: &str,
        state: BillingState,
        suspended_at: Option<TimestampMs>,
        destroy_after: Option<TimestampMs>,
        now: TimestampMs,
    ) -> Result<()> {
        let mut bots = self.bots.lock().await;
        let bot = bots
            .get_mut(id)
            .ok_or_else(|| HelmsmanError::NotFound(format!("bot {}", id)))?;
        bot.billing_state = state;
        bot.suspended_at = suspended_at;
        bot.destroy_after = destroy_after;
        bot.updated_at = now;
        Ok(())
    }

    async fn list_suspended_expired(&self, now: TimestampMs) -> Result<Vec<BotInstance>> {
        let mut bots: Vec<BotInstance> = self
            .bots
            .lock()
            .await
            .values()
            .filter(|b| {
                b.billing_state == BillingState::Suspended
                    && b.destroy_after.is_some_and(|d| d < now)
            })
            .cloned()
            .collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }
}
