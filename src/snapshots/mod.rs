//! Snapshot management
//!
//! On-demand captures, nightly/hot backup triggers for the fleet, and the
//! two-phase retention sweep (soft-delete on expiry, hard-delete plus remote
//! removal after the retention window).

pub mod archive;
pub mod keys;

pub use archive::ArchiveCipher;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::fabric::{NodeCommand, NodeConnectionManager};
use crate::registry::{
    BillingState, BotInstanceRepository, Snapshot, SnapshotKind, SnapshotRepository,
};
use crate::storage::ObjectStore;
use crate::types::{clock::to_date, Clock, HelmsmanError, Result};

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// How long a soft-deleted snapshot lingers before hard deletion; also
    /// the default expiry for nightly snapshots
    pub retention_ms: i64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

pub struct SnapshotService {
    snapshots: Arc<dyn SnapshotRepository>,
    bots: Arc<dyn BotInstanceRepository>,
    fabric: Arc<NodeConnectionManager>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    config: SnapshotConfig,
}

impl SnapshotService {
    pub fn new(
        snapshots: Arc<dyn SnapshotRepository>,
        bots: Arc<dyn BotInstanceRepository>,
        fabric: Arc<NodeConnectionManager>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            snapshots,
            bots,
            fabric,
            store,
            clock,
            config,
        }
    }

    /// Capture an on-demand snapshot of one workload. The node exports the
    /// container and uploads the archive; the coordinator records the row.
    pub async fn capture_on_demand(
        &self,
        bot_id: &str,
        label: Option<&str>,
    ) -> Result<Snapshot> {
        let bot = self
            .bots
            .get(bot_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("bot {}", bot_id)))?;
        let node_id = bot.node_id.clone().ok_or_else(|| {
            HelmsmanError::BadRequest(format!("workload {} is not placed on any node", bot_id))
        })?;

        let container = bot.container_name();
        let export = self
            .fabric
            .send_command(&node_id, NodeCommand::BotExport {
                name: container.clone(),
            })
            .await?;
        let filename = export
            .get("filename")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}.tar.gz", container));
        let size_bytes = export.get("size_bytes").and_then(|s| s.as_u64()).unwrap_or(0);

        self.fabric
            .send_command(&node_id, NodeCommand::BackupUpload {
                filename: filename.clone(),
            })
            .await?;

        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let snapshot = Snapshot {
            id: snapshot_id.clone(),
            tenant_id: bot.tenant_id.clone(),
            instance_id: bot.id.clone(),
            kind: SnapshotKind::OnDemand,
            storage_path: filename,
            remote_key: Some(keys::on_demand(&bot.tenant_id, &snapshot_id, label)),
            size_bytes,
            created_at: self.clock.now_ms(),
            expires_at: None,
            deleted_at: None,
        };
        self.snapshots.insert(&snapshot).await?;
        info!(bot_id, snapshot_id = %snapshot.id, "On-demand snapshot captured");
        Ok(snapshot)
    }

    /// Restore a workload from a stored snapshot.
    ///
    /// A pre-restore safety snapshot is taken first, so a bad restore can
    /// itself be undone. Then the node pulls the archive and recreates the
    /// container from it.
    pub async fn restore(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self
            .snapshots
            .get(snapshot_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("snapshot {}", snapshot_id)))?;
        if snapshot.deleted_at.is_some() {
            return Err(HelmsmanError::Conflict(format!(
                "snapshot {} is deleted",
                snapshot_id
            )));
        }
        let remote_key = snapshot.remote_key.clone().ok_or_else(|| {
            HelmsmanError::Conflict(format!("snapshot {} was never uploaded", snapshot_id))
        })?;
        let bot = self
            .bots
            .get(&snapshot.instance_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("bot {}", snapshot.instance_id)))?;
        let node_id = bot.node_id.clone().ok_or_else(|| {
            HelmsmanError::BadRequest(format!("workload {} is not placed on any node", bot.id))
        })?;

        let container = bot.container_name();
        let now = self.clock.now_ms();

        // Safety net before overwriting live state
        let export = self
            .fabric
            .send_command(&node_id, NodeCommand::BotExport {
                name: container.clone(),
            })
            .await?;
        let filename = export
            .get("filename")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}.tar.gz", container));
        self.fabric
            .send_command(&node_id, NodeCommand::BackupUpload {
                filename: filename.clone(),
            })
            .await?;
        self.snapshots
            .insert(&Snapshot {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: bot.tenant_id.clone(),
                instance_id: bot.id.clone(),
                kind: SnapshotKind::PreRestore,
                storage_path: filename,
                remote_key: Some(keys::pre_restore(&bot.tenant_id)),
                size_bytes: export.get("size_bytes").and_then(|s| s.as_u64()).unwrap_or(0),
                created_at: now,
                expires_at: Some(now + self.config.retention_ms),
                deleted_at: None,
            })
            .await?;

        self.fabric
            .send_command(&node_id, NodeCommand::BackupDownload {
                filename: remote_key,
            })
            .await?;
        self.fabric
            .send_command(&node_id, NodeCommand::BotImport {
                name: container,
                image: bot.image.clone(),
                env: bot.env.clone(),
            })
            .await?;
        info!(snapshot_id, bot_id = %bot.id, "Snapshot restored");
        Ok(())
    }

    /// Ask every connected node to run its nightly backups and record the
    /// expected rows
    pub async fn trigger_nightly(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let date = to_date(now);
        let mut triggered = 0;

        for node_id in self.fabric.connected_nodes() {
            if let Err(e) = self
                .fabric
                .send_command(&node_id, NodeCommand::BackupRunNightly)
                .await
            {
                warn!(node_id = %node_id, error = %e, "Nightly backup trigger failed");
                continue;
            }
            triggered += 1;

            for bot in self.bots.list_by_node(&node_id).await? {
                if bot.billing_state != BillingState::Active {
                    continue;
                }
                let snapshot = Snapshot {
                    id: uuid::Uuid::new_v4().to_string(),
                    tenant_id: bot.tenant_id.clone(),
                    instance_id: bot.id.clone(),
                    kind: SnapshotKind::Nightly,
                    storage_path: format!("{}.tar.gz", bot.container_name()),
                    remote_key: Some(keys::nightly(&node_id, &bot.tenant_id, &date)),
                    size_bytes: 0,
                    created_at: now,
                    expires_at: Some(now + self.config.retention_ms),
                    deleted_at: None,
                };
                self.snapshots.insert(&snapshot).await?;
            }
        }
        Ok(triggered)
    }

    /// Refresh the rolling `latest/` hot backups recovery depends on
    pub async fn trigger_hot(&self) -> Result<usize> {
        let mut triggered = 0;
        for node_id in self.fabric.connected_nodes() {
            match self
                .fabric
                .send_command(&node_id, NodeCommand::BackupRunHot)
                .await
            {
                Ok(_) => triggered += 1,
                Err(e) => warn!(node_id = %node_id, error = %e, "Hot backup trigger failed"),
            }
        }
        Ok(triggered)
    }

    /// Two-phase retention: expire to soft-deleted, then purge remote and
    /// row after the retention window
    pub async fn retention_sweep(&self) -> Result<(usize, usize)> {
        let now = self.clock.now_ms();

        let mut expired = 0;
        for snapshot in self.snapshots.list_expired(now).await? {
            self.snapshots.soft_delete(&snapshot.id, now).await?;
            expired += 1;
        }

        let mut purged = 0;
        for snapshot in self
            .snapshots
            .list_purgeable(now - self.config.retention_ms)
            .await?
        {
            if let Some(ref key) = snapshot.remote_key {
                if let Err(e) = self.store.remove(key).await {
                    warn!(snapshot_id = %snapshot.id, key = %key, error = %e,
                        "Remote removal failed; snapshot kept for next sweep");
                    continue;
                }
            }
            self.snapshots.hard_delete(&snapshot.id).await?;
            purged += 1;
        }

        if expired > 0 || purged > 0 {
            info!(expired, purged, "Snapshot retention sweep finished");
        }
        Ok((expired, purged))
    }

    /// Periodic retention sweeps
    pub fn spawn_retention(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.retention_sweep().await {
                    error!(error = %e, "Retention sweep failed");
                }
            }
        })
    }

    /// Periodic hot-backup refresh
    pub fn spawn_hot_backups(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.trigger_hot().await {
                    error!(error = %e, "Hot backup trigger sweep failed");
                }
            }
        })
    }
}
