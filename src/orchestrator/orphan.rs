//! Orphan cleanup for returning nodes
//!
//! While a node was offline, recovery moved its tenants elsewhere. On reboot
//! the node agent may auto-restart those containers, so the first heartbeat
//! after re-registration is reconciled against the database: containers whose
//! workload now lives elsewhere (or no longer exists) are stopped on the
//! returning node. A clean sweep promotes the node back to `active`; a
//! partial sweep leaves it `returning` until its next connection.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::fabric::protocol::ContainerReport;
use crate::fabric::{NodeCommand, NodeConnectionManager};
use crate::registry::{bot_id_from_container, BotInstanceRepository, NodeRepository, NodeStatus};
use crate::types::{Clock, Result};

/// Outcome of one sweep
#[derive(Debug, Clone, Default)]
pub struct OrphanSweep {
    pub node_id: String,
    /// Containers whose workload is (still) assigned to this node
    pub kept: Vec<String>,
    /// Orphan containers successfully stopped
    pub stopped: Vec<String>,
    /// Orphan containers whose stop command failed, with reasons
    pub failed: Vec<(String, String)>,
    /// True when the sweep promoted the node to `active`
    pub activated: bool,
}

pub struct OrphanCleaner {
    fabric: Arc<NodeConnectionManager>,
    nodes: Arc<dyn NodeRepository>,
    bots: Arc<dyn BotInstanceRepository>,
    clock: Arc<dyn Clock>,
}

impl OrphanCleaner {
    pub fn new(
        fabric: Arc<NodeConnectionManager>,
        nodes: Arc<dyn NodeRepository>,
        bots: Arc<dyn BotInstanceRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fabric,
            nodes,
            bots,
            clock,
        }
    }

    /// Reconcile a returning node's reported containers against the database
    pub async fn sweep(
        &self,
        node_id: &str,
        containers: &[ContainerReport],
    ) -> Result<OrphanSweep> {
        let mut sweep = OrphanSweep {
            node_id: node_id.to_string(),
            ..Default::default()
        };

        for container in containers {
            let Some(bot_id) = bot_id_from_container(&container.name) else {
                debug!(node_id, container = %container.name, "Unmanaged container ignored");
                continue;
            };

            let assigned_here = match self.bots.get(bot_id).await? {
                Some(bot) => bot.node_id.as_deref() == Some(node_id),
                // The workload no longer exists; its container is an orphan
                None => false,
            };

            if assigned_here {
                sweep.kept.push(container.name.clone());
                continue;
            }

            match self
                .fabric
                .send_command(
                    node_id,
                    NodeCommand::BotStop {
                        name: container.name.clone(),
                    },
                )
                .await
            {
                Ok(_) => {
                    info!(node_id, container = %container.name, "Orphan container stopped");
                    sweep.stopped.push(container.name.clone());
                }
                Err(e) => {
                    warn!(node_id, container = %container.name, error = %e, "Orphan stop failed");
                    sweep.failed.push((container.name.clone(), e.to_string()));
                }
            }
        }

        if sweep.failed.is_empty() {
            sweep.activated = self
                .nodes
                .transition(
                    node_id,
                    NodeStatus::Returning,
                    NodeStatus::Active,
                    self.clock.now_ms(),
                )
                .await?;
            if sweep.activated {
                info!(
                    node_id,
                    kept = sweep.kept.len(),
                    stopped = sweep.stopped.len(),
                    "Orphan sweep clean; node active"
                );
            }
        } else {
            warn!(
                node_id,
                failures = sweep.failed.len(),
                "Orphan sweep incomplete; node stays returning"
            );
        }

        Ok(sweep)
    }
}
