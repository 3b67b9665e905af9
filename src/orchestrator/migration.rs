//! Live migration between healthy nodes
//!
//! The downtime window is the heart of the sequence: everything that can be
//! done while the source container is still serving (export, upload,
//! download) happens first. Only then is the source stopped, and the window
//! closes when the routing is repointed after the target verifies. If
//! anything fails after the stop, the container is restarted on the source
//! before the original error surfaces, bounding downtime to one attempt.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::events::{EventBus, FleetEvent};
use crate::fabric::{NodeCommand, NodeConnectionManager};
use crate::registry::{BillingState, BotInstance, BotInstanceRepository, NodeRepository, NodeStatus};
use crate::snapshots::keys;
use crate::types::{Clock, HelmsmanError, Result, TimestampMs};

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Memory estimate when the caller does not supply one
    pub default_estimate_mb: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            default_estimate_mb: 100,
        }
    }
}

/// Outcome of one migration
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub bot_id: String,
    pub source_node: String,
    pub target_node: String,
    /// Milliseconds between source stop and routing repoint
    pub downtime_ms: i64,
}

/// Outcome of draining a node
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub node_id: String,
    pub migrated: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// True when every resident workload left and the node went offline
    pub completed: bool,
}

pub struct MigrationManager {
    fabric: Arc<NodeConnectionManager>,
    nodes: Arc<dyn NodeRepository>,
    bots: Arc<dyn BotInstanceRepository>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: MigrationConfig,
    /// Per-workload exclusion: one migration at a time
    in_flight: DashMap<String, ()>,
}

impl MigrationManager {
    pub fn new(
        fabric: Arc<NodeConnectionManager>,
        nodes: Arc<dyn NodeRepository>,
        bots: Arc<dyn BotInstanceRepository>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: MigrationConfig,
    ) -> Self {
        Self {
            fabric,
            nodes,
            bots,
            clock,
            events,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Migrate one workload. The target is chosen by placement when omitted,
    /// excluding the current node.
    pub async fn migrate(
        &self,
        bot_id: &str,
        target_node_id: Option<&str>,
        estimated_mb: Option<u64>,
    ) -> Result<MigrationResult> {
        match self.in_flight.entry(bot_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(HelmsmanError::Conflict(format!(
                    "migration already in progress for workload {}",
                    bot_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(());
            }
        }

        let result = self
            .run_migration(bot_id, target_node_id, estimated_mb)
            .await;
        self.in_flight.remove(bot_id);
        result
    }

    async fn run_migration(
        &self,
        bot_id: &str,
        target_node_id: Option<&str>,
        estimated_mb: Option<u64>,
    ) -> Result<MigrationResult> {
        let bot = self
            .bots
            .get(bot_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("bot {}", bot_id)))?;
        let source = bot.node_id.clone().ok_or_else(|| {
            HelmsmanError::BadRequest(format!("workload {} is not placed on any node", bot_id))
        })?;
        let estimate = estimated_mb.unwrap_or(self.config.default_estimate_mb);

        let target = self.pick_target(&source, target_node_id, estimate).await?;
        info!(
            bot_id,
            source_node = %source,
            target_node = %target,
            estimate_mb = estimate,
            "Migration starting"
        );

        let container = bot.container_name();
        let backup_key = keys::hot_backup(&container);

        // Source still serving: export, upload, pre-stage on the target
        let export = self
            .fabric
            .send_command(&source, NodeCommand::BotExport {
                name: container.clone(),
            })
            .await?;
        let archive = export
            .get("filename")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}.tar.gz", container));

        self.fabric
            .send_command(&source, NodeCommand::BackupUpload {
                filename: archive.clone(),
            })
            .await?;
        self.fabric
            .send_command(&target, NodeCommand::BackupDownload {
                filename: backup_key.clone(),
            })
            .await?;

        // Downtime begins
        self.fabric
            .send_command(&source, NodeCommand::BotStop {
                name: container.clone(),
            })
            .await?;
        let stopped_at = self.clock.now_ms();

        match self.bring_up_on_target(&bot, &target, stopped_at).await {
            Ok(downtime_ms) => {
                self.fabric.adjust_used(&target, estimate as i64).await?;
                self.fabric.adjust_used(&source, -(estimate as i64)).await?;
                info!(bot_id, target_node = %target, downtime_ms, "Migration complete");
                Ok(MigrationResult {
                    bot_id: bot_id.to_string(),
                    source_node: source,
                    target_node: target,
                    downtime_ms,
                })
            }
            Err(original) => {
                // Roll back to the source to restore service, then surface
                // the error that broke the attempt
                warn!(bot_id, error = %original, "Migration failed after stop; restarting on source");
                if let Err(e) = self
                    .fabric
                    .send_command(&source, NodeCommand::BotStart {
                        name: container,
                        image: bot.image.clone(),
                        env: bot.env.clone(),
                        restart: Some(true),
                    })
                    .await
                {
                    error!(bot_id, source_node = %source, error = %e, "Source restart failed; workload is down");
                }
                Err(original)
            }
        }
    }

    /// Steps inside the downtime window: import, verify, repoint routing
    async fn bring_up_on_target(
        &self,
        bot: &BotInstance,
        target: &str,
        stopped_at: TimestampMs,
    ) -> Result<i64> {
        let container = bot.container_name();
        self.fabric
            .send_command(target, NodeCommand::BotImport {
                name: container.clone(),
                image: bot.image.clone(),
                env: bot.env.clone(),
            })
            .await?;

        let inspect = self
            .fabric
            .send_command(target, NodeCommand::BotInspect { name: container })
            .await?;
        if !inspect
            .get("running")
            .and_then(|r| r.as_bool())
            .unwrap_or(false)
        {
            return Err(HelmsmanError::CommandFailed(format!(
                "container for {} not running on {} after import",
                bot.id, target
            )));
        }

        // Downtime ends here
        self.fabric.reassign_tenant(&bot.id, target).await?;
        Ok(self.clock.now_ms() - stopped_at)
    }

    async fn pick_target(
        &self,
        source: &str,
        target_node_id: Option<&str>,
        estimate: u64,
    ) -> Result<String> {
        match target_node_id {
            Some(target) => {
                if target == source {
                    return Err(HelmsmanError::BadRequest(
                        "migration target equals source".to_string(),
                    ));
                }
                let node = self
                    .nodes
                    .get(target)
                    .await?
                    .ok_or_else(|| HelmsmanError::NotFound(format!("node {}", target)))?;
                if !node.status.is_placement_candidate() || node.free_mb() < estimate {
                    return Err(HelmsmanError::NoCapacity(format!(
                        "node {} cannot take {} MB",
                        target, estimate
                    )));
                }
                Ok(target.to_string())
            }
            None => match self.fabric.find_best_target(Some(source), estimate).await? {
                Some(node) => Ok(node.id),
                None => {
                    let _ = self.events.send(FleetEvent::CapacityOverflow {
                        needed_mb: estimate,
                        context: format!("migration from {}", source),
                    });
                    Err(HelmsmanError::NoCapacity(format!(
                        "no placement target for {} MB",
                        estimate
                    )))
                }
            },
        }
    }

    /// Drain a node: stop new placements, migrate every running workload
    /// away, and take the node offline once empty.
    pub async fn drain(&self, node_id: &str) -> Result<DrainReport> {
        let now = self.clock.now_ms();
        let node = self
            .nodes
            .get(node_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("node {}", node_id)))?;
        match node.status {
            NodeStatus::Active => {
                self.nodes
                    .transition(node_id, NodeStatus::Active, NodeStatus::Draining, now)
                    .await?;
            }
            NodeStatus::Draining => {} // resume a previous drain
            other => {
                return Err(HelmsmanError::Conflict(format!(
                    "cannot drain node {} in status {}",
                    node_id,
                    other.as_str()
                )));
            }
        }

        let mut report = DrainReport {
            node_id: node_id.to_string(),
            ..Default::default()
        };

        for bot in self.bots.list_by_node(node_id).await? {
            if bot.billing_state != BillingState::Active {
                // No running container to move; recovery-by-backup applies
                // if the instance is ever reactivated
                report.skipped.push(bot.id);
                continue;
            }
            match self.migrate(&bot.id, None, None).await {
                Ok(_) => report.migrated.push(bot.id),
                Err(e) => report.failed.push((bot.id, e.to_string())),
            }
        }

        if report.failed.is_empty() {
            report.completed = self
                .nodes
                .transition(
                    node_id,
                    NodeStatus::Draining,
                    NodeStatus::Offline,
                    self.clock.now_ms(),
                )
                .await?;
            info!(node_id, migrated = report.migrated.len(), "Drain complete; node offline");
        } else {
            let _ = self.events.send(FleetEvent::CapacityOverflow {
                needed_mb: self.config.default_estimate_mb,
                context: format!("drain of {}", node_id),
            });
            warn!(
                node_id,
                failures = report.failed.len(),
                "Drain incomplete; node stays draining"
            );
        }
        Ok(report)
    }
}
