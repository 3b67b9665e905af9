//! Node repository
//!
//! One interface, two implementations: SQLite for deployments and a pure
//! in-memory variant honoring the same contract for tests and embedding.
//! Registration transitions are applied atomically inside the repository so
//! a racing heartbeat cannot observe a half-applied update.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::models::{Node, NodeStatus};
use crate::db::Db;
use crate::types::{HelmsmanError, Result, TimestampMs};

/// Fields carried by a node registration request
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub node_id: String,
    pub host: String,
    pub capacity_mb: u64,
    pub agent_version: String,
}

/// Status assigned by a (re-)registration, given the current status
pub fn status_after_registration(current: Option<NodeStatus>) -> NodeStatus {
    match current {
        None => NodeStatus::Active,
        Some(NodeStatus::Offline) | Some(NodeStatus::Recovering) | Some(NodeStatus::Failed) => {
            NodeStatus::Returning
        }
        Some(NodeStatus::Unhealthy) => NodeStatus::Active,
        Some(keep) => keep,
    }
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Node>>;

    async fn list(&self) -> Result<Vec<Node>>;

    /// Create or update the record for a registering node, applying the
    /// status transition rules atomically. Returns the stored record.
    async fn upsert_registration(
        &self,
        reg: &NodeRegistration,
        now: TimestampMs,
    ) -> Result<Node>;

    async fn set_status(&self, id: &str, status: NodeStatus, now: TimestampMs) -> Result<()>;

    /// Conditional transition: applied only while the node is still in
    /// `from`. Returns whether the transition happened.
    async fn transition(
        &self,
        id: &str,
        from: NodeStatus,
        to: NodeStatus,
        now: TimestampMs,
    ) -> Result<bool>;

    async fn set_secret_hash(&self, id: &str, hash: &str, now: TimestampMs) -> Result<()>;

    /// Bump liveness and reported memory usage. Never touches status.
    async fn update_heartbeat(&self, id: &str, used_mb: u64, now: TimestampMs) -> Result<()>;

    /// Capacity accounting after placement changes (positive or negative)
    async fn adjust_used(&self, id: &str, delta_mb: i64, now: TimestampMs) -> Result<()>;
}

// =============================================================================
// SQLite implementation
// =============================================================================

pub struct SqliteNodeRepository {
    db: Db,
}

impl SqliteNodeRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

type NodeRow = (
    String,
    String,
    i64,
    i64,
    String,
    Option<i64>,
    String,
    Option<String>,
    i64,
    i64,
);

fn node_from_row(row: NodeRow) -> Result<Node> {
    Ok(Node {
        id: row.0,
        host: row.1,
        capacity_mb: row.2.max(0) as u64,
        used_mb: row.3.max(0) as u64,
        status: NodeStatus::parse(&row.4)?,
        last_heartbeat_at: row.5,
        agent_version: row.6,
        secret_hash: row.7,
        registered_at: row.8,
        updated_at: row.9,
    })
}

const NODE_COLUMNS: &str = "id, host, capacity_mb, used_mb, status, last_heartbeat_at, \
     agent_version, secret_hash, registered_at, updated_at";

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn get(&self, id: &str) -> Result<Option<Node>> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let row: Option<NodeRow> = conn
                    .query_row(
                        &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
                        params![id],
                        |r| {
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
                        },
                    )
                    .optional()?;
                row.map(node_from_row).transpose()
            })
            .await
    }

    async fn list(&self) -> Result<Vec<Node>> {
        self.db
            .with(|conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {} FROM nodes ORDER BY id", NODE_COLUMNS))?;
                let rows = stmt
                    .query_map([], |r| {
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
                    })?
                    .collect::<rusqlite::Result<Vec<NodeRow>>>()?;
                rows.into_iter().map(node_from_row).collect()
            })
            .await
    }

    async fn upsert_registration(
        &self,
        reg: &NodeRegistration,
        now: TimestampMs,
    ) -> Result<Node> {
        let reg = reg.clone();
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM nodes WHERE id = ?1",
                        params![reg.node_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                let current_status = current.as_deref().map(NodeStatus::parse).transpose()?;
                let next = status_after_registration(current_status);

                if current_status.is_none() {
                    tx.execute(
                        "INSERT INTO nodes (id, host, capacity_mb, used_mb, status, \
                         agent_version, registered_at, updated_at) \
                         VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6)",
                        params![
                            reg.node_id,
                            reg.host,
                            reg.capacity_mb as i64,
                            next.as_str(),
                            reg.agent_version,
                            now
                        ],
                    )?;
                } else {
                    tx.execute(
                        "UPDATE nodes SET host = ?2, capacity_mb = ?3, agent_version = ?4, \
                         status = ?5, updated_at = ?6 WHERE id = ?1",
                        params![
                            reg.node_id,
                            reg.host,
                            reg.capacity_mb as i64,
                            reg.agent_version,
                            next.as_str(),
                            now
                        ],
                    )?;
                }

                let row: NodeRow = tx.query_row(
                    &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
                    params![reg.node_id],
                    |r| {
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
                    },
                )?;
                tx.commit()?;
                node_from_row(row)
            })
            .await
    }

    async fn set_status(&self, id: &str, status: NodeStatus, now: TimestampMs) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE nodes SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), now],
                )?;
                if changed == 0 {
                    return Err(HelmsmanError::NotFound(format!("node {}", id)));
                }
                Ok(())
            })
            .await
    }

    async fn transition(
        &self,
        id: &str,
        from: NodeStatus,
        to: NodeStatus,
        now: TimestampMs,
    ) -> Result<bool> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                let changed = conn.execute(
                    "UPDATE nodes SET status = ?3, updated_at = ?4 \
                     WHERE id = ?1 AND status = ?2",
                    params![id, from.as_str(), to.as_str(), now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn set_secret_hash(&self, id: &str, hash: &str, now: TimestampMs) -> Result<()> {
        let id = id.to_string();
        let hash = hash.to_string();
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE nodes SET secret_hash = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, hash, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn update_heartbeat(&self, id: &str, used_mb: u64, now: TimestampMs) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE nodes SET used_mb = ?2, last_heartbeat_at = ?3, updated_at = ?3 \
                     WHERE id = ?1",
                    params![id, used_mb as i64, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn adjust_used(&self, id: &str, delta_mb: i64, now: TimestampMs) -> Result<()> {
        let id = id.to_string();
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE nodes SET used_mb = MAX(0, used_mb + ?2), updated_at = ?3 \
                     WHERE id = ?1",
                    params![id, delta_mb, now],
                )?;
                Ok(())
            })
            .await
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
pub struct MemoryNodeRepository {
    nodes: Mutex<HashMap<String, Node>>,
}

impl MemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRepository for MemoryNodeRepository {
    async fn get(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.nodes.lock().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.lock().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn upsert_registration(
        &self,
        reg: &NodeRegistration,
        now: TimestampMs,
    ) -> Result<Node> {
        let mut nodes = self.nodes.lock().await;
        let next = status_after_registration(nodes.get(&reg.node_id).map(|n| n.status));
        let node = match nodes.get_mut(&reg.node_id) {
            Some(existing) => {
                existing.host = reg.host.clone();
                existing.capacity_mb = reg.capacity_mb;
                existing.agent_version = reg.agent_version.clone();
                existing.status = next;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let node = Node {
                    id: reg.node_id.clone(),
                    host: reg.host.clone(),
                    capacity_mb: reg.capacity_mb,
                    used_mb: 0,
                    status: next,
                    last_heartbeat_at: None,
                    agent_version: reg.agent_version.clone(),
                    secret_hash: None,
                    registered_at: now,
                    updated_at: now,
                };
                nodes.insert(reg.node_id.clone(), node.clone());
                node
            }
        };
        Ok(node)
    }

    async fn set_status(&self, id: &str, status: NodeStatus, now: TimestampMs) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| HelmsmanError::NotFound(format!("node {}", id)))?;
        node.status = status;
        node.updated_at = now;
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        from: NodeStatus,
        to: NodeStatus,
        now: TimestampMs,
    ) -> Result<bool> {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(id) {
            Some(node) if node.status == from => {
                node.status = to;
                node.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_secret_hash(&self, id: &str, hash: &str, now: TimestampMs) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(id) {
            node.secret_hash = Some(hash.to_string());
            node.updated_at = now;
        }
        Ok(())
    }

    async fn update_heartbeat(&self, id: &str, used_mb: u64, now: TimestampMs) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(id) {
            node.used_mb = used_mb;
            node.last_heartbeat_at = Some(now);
            node.updated_at = now;
        }
        Ok(())
    }

    async fn adjust_used(&self, id: &str, delta_mb: i64, now: TimestampMs) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(id) {
            node.used_mb = (node.used_mb as i64 + delta_mb).max(0) as u64;
            node.updated_at = now;
        }
        Ok(())
    }
}
