//! Node-failure recovery
//!
//! Unlike migration, the source node is presumed dead: each tenant is
//! rebuilt on a fresh target from its most recent hot backup in object
//! storage. Tenants are processed enterprise first, free last, id ascending
//! within a tier. Failures are recorded per tenant and never abort the run;
//! capacity misses park the tenant as `waiting` until capacity is added and
//! `retry_waiting` is called.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::events::{EventBus, FleetEvent};
use crate::fabric::{NodeCommand, NodeConnectionManager};
use crate::registry::{
    BillingState, BotInstance, BotInstanceRepository, NodeRepository, NodeStatus, RecoveryCounters,
    RecoveryEvent, RecoveryItem, RecoveryItemStatus, RecoveryLogRepository, RecoveryStatus,
    RecoveryTrigger,
};
use crate::snapshots::keys;
use crate::types::{Clock, HelmsmanError, Result};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Conservative memory estimate when a tenant's usage is unknown
    pub default_estimate_mb: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_estimate_mb: 100,
        }
    }
}

/// Summary returned to the caller and serialized into the event report
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoverySummary {
    pub event_id: String,
    pub node_id: String,
    pub total: u32,
    pub recovered: u32,
    pub failed: u32,
    pub waiting: u32,
    pub status: RecoveryStatus,
}

enum ItemOutcome {
    Recovered { target: String },
    Waiting { reason: String },
    Failed { reason: String },
}

pub struct RecoveryManager {
    fabric: Arc<NodeConnectionManager>,
    nodes: Arc<dyn NodeRepository>,
    bots: Arc<dyn BotInstanceRepository>,
    recovery_log: Arc<dyn RecoveryLogRepository>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: RecoveryConfig,
    /// One recovery per node at a time
    in_flight: DashMap<String, ()>,
}

impl RecoveryManager {
    pub fn new(
        fabric: Arc<NodeConnectionManager>,
        nodes: Arc<dyn NodeRepository>,
        bots: Arc<dyn BotInstanceRepository>,
        recovery_log: Arc<dyn RecoveryLogRepository>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            fabric,
            nodes,
            bots,
            recovery_log,
            clock,
            events,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Relocate every tenant off a dead node
    pub async fn recover_node(
        &self,
        node_id: &str,
        trigger: RecoveryTrigger,
    ) -> Result<RecoverySummary> {
        match self.in_flight.entry(node_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(HelmsmanError::Conflict(format!(
                    "recovery already running for node {}",
                    node_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(());
            }
        }
        let result = self.run_recovery(node_id, trigger).await;
        self.in_flight.remove(node_id);
        result
    }

    async fn run_recovery(
        &self,
        node_id: &str,
        trigger: RecoveryTrigger,
    ) -> Result<RecoverySummary> {
        if let Some(open) = self.recovery_log.open_event_for_node(node_id).await? {
            return Err(HelmsmanError::Conflict(format!(
                "recovery event {} already in progress for node {}",
                open.id, node_id
            )));
        }

        let now = self.clock.now_ms();
        self.nodes
            .set_status(node_id, NodeStatus::Recovering, now)
            .await?;

        let resident = self.bots.list_by_node(node_id).await?;

        // Suspended instances have no running container anywhere; clear the
        // dead-node assignment and let reactivation re-place them from backup
        for bot in resident
            .iter()
            .filter(|b| b.billing_state == BillingState::Suspended)
        {
            self.fabric.unassign_tenant(&bot.id).await?;
        }

        // Priority order: enterprise > pro > starter > free, id ascending
        let mut tenants: Vec<BotInstance> = resident
            .into_iter()
            .filter(|b| b.billing_state == BillingState::Active)
            .collect();
        tenants.sort_by(|a, b| {
            a.resource_tier
                .recovery_rank()
                .cmp(&b.resource_tier.recovery_rank())
                .then_with(|| a.id.cmp(&b.id))
        });

        let event = RecoveryEvent {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            trigger,
            status: RecoveryStatus::InProgress,
            total: tenants.len() as u32,
            recovered: 0,
            failed: 0,
            waiting: 0,
            started_at: now,
            completed_at: None,
            report: None,
        };
        self.recovery_log.create_event(&event).await?;
        info!(
            node_id,
            event_id = %event.id,
            tenants = tenants.len(),
            trigger = trigger.as_str(),
            "Recovery starting"
        );

        let mut counters = RecoveryCounters {
            total: tenants.len() as u32,
            ..Default::default()
        };

        for bot in &tenants {
            // A re-registration closes the event mid-flight; stop at the
            // tenant boundary and leave relocated tenants where they are
            match self.recovery_log.get_event(&event.id).await? {
                Some(e) if e.status == RecoveryStatus::InProgress => {}
                _ => {
                    info!(node_id, event_id = %event.id, "Recovery event closed externally; stopping");
                    return Ok(RecoverySummary {
                        event_id: event.id.clone(),
                        node_id: node_id.to_string(),
                        total: counters.total,
                        recovered: counters.recovered,
                        failed: counters.failed,
                        waiting: counters.waiting,
                        status: RecoveryStatus::Completed,
                    });
                }
            }

            let outcome = self.relocate(bot, node_id).await;
            let item_now = self.clock.now_ms();
            let (status, target, reason) = match &outcome {
                ItemOutcome::Recovered { target } => {
                    counters.recovered += 1;
                    (RecoveryItemStatus::Recovered, Some(target.clone()), None)
                }
                ItemOutcome::Waiting { reason } => {
                    counters.waiting += 1;
                    (RecoveryItemStatus::Waiting, None, Some(reason.clone()))
                }
                ItemOutcome::Failed { reason } => {
                    counters.failed += 1;
                    (RecoveryItemStatus::Failed, None, Some(reason.clone()))
                }
            };
            self.recovery_log
                .add_item(&RecoveryItem {
                    id: uuid::Uuid::new_v4().to_string(),
                    recovery_event_id: event.id.clone(),
                    tenant_id: bot.tenant_id.clone(),
                    bot_id: bot.id.clone(),
                    source_node: node_id.to_string(),
                    target_node: target,
                    backup_key: keys::hot_backup(&bot.container_name()),
                    status,
                    reason,
                    created_at: item_now,
                    updated_at: item_now,
                })
                .await?;
        }

        let status = if counters.waiting == 0 {
            RecoveryStatus::Completed
        } else {
            RecoveryStatus::Partial
        };
        let summary = RecoverySummary {
            event_id: event.id.clone(),
            node_id: node_id.to_string(),
            total: counters.total,
            recovered: counters.recovered,
            failed: counters.failed,
            waiting: counters.waiting,
            status,
        };
        let done = self.clock.now_ms();
        self.recovery_log
            .finalize_event(
                &event.id,
                status,
                counters,
                Some(done),
                Some(serde_json::to_string(&summary)?),
            )
            .await?;

        // The node is done recovering; unless it re-registered meanwhile
        // (now `returning`), it rests offline
        self.nodes
            .transition(node_id, NodeStatus::Recovering, NodeStatus::Offline, done)
            .await?;

        info!(
            node_id,
            event_id = %event.id,
            recovered = counters.recovered,
            failed = counters.failed,
            waiting = counters.waiting,
            status = status.as_str(),
            "Recovery finished"
        );
        Ok(summary)
    }

    /// Rebuild one tenant on a fresh target from its hot backup
    async fn relocate(&self, bot: &BotInstance, dead_node: &str) -> ItemOutcome {
        let estimate = self.config.default_estimate_mb;

        let target = match self.fabric.find_best_target(Some(dead_node), estimate).await {
            Ok(Some(node)) => node.id,
            Ok(None) => {
                let _ = self.events.send(FleetEvent::CapacityOverflow {
                    needed_mb: estimate,
                    context: format!("recovery of {} from {}", bot.id, dead_node),
                });
                warn!(bot_id = %bot.id, "No capacity for recovery; tenant waiting");
                return ItemOutcome::Waiting {
                    reason: "no_capacity".to_string(),
                };
            }
            Err(e) => {
                return ItemOutcome::Failed {
                    reason: format!("placement lookup failed: {}", e),
                }
            }
        };

        match self.restore_on(bot, &target, estimate).await {
            Ok(()) => {
                info!(bot_id = %bot.id, target_node = %target, "Tenant recovered");
                ItemOutcome::Recovered { target }
            }
            Err(e) => {
                error!(bot_id = %bot.id, target_node = %target, error = %e, "Tenant recovery failed");
                ItemOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn restore_on(&self, bot: &BotInstance, target: &str, estimate: u64) -> Result<()> {
        let container = bot.container_name();
        self.fabric
            .send_command(target, NodeCommand::BackupDownload {
                filename: keys::hot_backup(&container),
            })
            .await?;
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
                "container for {} not running on {} after restore",
                bot.id, target
            )));
        }

        self.fabric.reassign_tenant(&bot.id, target).await?;
        self.fabric.adjust_used(target, estimate as i64).await?;
        Ok(())
    }

    /// Re-run the `waiting` items of a partial recovery after capacity was
    /// added. Successes are marked `retried`; a run with no remaining
    /// waiting items completes the event.
    pub async fn retry_waiting(&self, event_id: &str) -> Result<RecoverySummary> {
        let event = self
            .recovery_log
            .get_event(event_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("recovery event {}", event_id)))?;
        if event.status != RecoveryStatus::Partial {
            return Err(HelmsmanError::Conflict(format!(
                "recovery event {} is {}, not partial",
                event_id,
                event.status.as_str()
            )));
        }

        let items = self.recovery_log.list_items(event_id).await?;
        let mut counters = RecoveryCounters {
            total: event.total,
            recovered: event.recovered,
            failed: event.failed,
            waiting: 0,
        };

        for item in items.iter().filter(|i| i.status == RecoveryItemStatus::Waiting) {
            let now = self.clock.now_ms();
            let Some(bot) = self.bots.get(&item.bot_id).await? else {
                counters.failed += 1;
                self.recovery_log
                    .update_item(&item.id, None, RecoveryItemStatus::Failed,
                        Some("workload no longer exists"), now)
                    .await?;
                continue;
            };

            match self.relocate(&bot, &item.source_node).await {
                ItemOutcome::Recovered { target } => {
                    counters.recovered += 1;
                    self.recovery_log
                        .update_item(
                            &item.id,
                            Some(&target),
                            RecoveryItemStatus::Retried,
                            None,
                            self.clock.now_ms(),
                        )
                        .await?;
                }
                ItemOutcome::Waiting { reason } => {
                    counters.waiting += 1;
                    self.recovery_log
                        .update_item(
                            &item.id,
                            None,
                            RecoveryItemStatus::Waiting,
                            Some(&reason),
                            self.clock.now_ms(),
                        )
                        .await?;
                }
                ItemOutcome::Failed { reason } => {
                    counters.failed += 1;
                    self.recovery_log
                        .update_item(
                            &item.id,
                            None,
                            RecoveryItemStatus::Failed,
                            Some(&reason),
                            self.clock.now_ms(),
                        )
                        .await?;
                }
            }
        }

        let status = if counters.waiting == 0 {
            RecoveryStatus::Completed
        } else {
            RecoveryStatus::Partial
        };
        let summary = RecoverySummary {
            event_id: event_id.to_string(),
            node_id: event.node_id.clone(),
            total: counters.total,
            recovered: counters.recovered,
            failed: counters.failed,
            waiting: counters.waiting,
            status,
        };
        self.recovery_log
            .finalize_event(
                event_id,
                status,
                counters,
                Some(self.clock.now_ms()),
                Some(serde_json::to_string(&summary)?),
            )
            .await?;
        info!(
            event_id,
            recovered = counters.recovered,
            waiting = counters.waiting,
            "Waiting items retried"
        );
        Ok(summary)
    }
}
