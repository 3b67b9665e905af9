//! Workload billing state machine
//!
//! active -> suspended on zero balance after a debit or by admin action;
//! suspended -> active when credit arrives and the balance is positive (or
//! by admin), unless the grace period already ran out; suspended ->
//! destroyed by the grace-period sweep. Destroyed is terminal.
//!
//! Container side effects (stop/start/remove) are best-effort: billing state
//! is authoritative in the database, and a node that missed a stop will be
//! reconciled by the orphan cleaner.

use std::sync::Arc;
use tracing::{info, warn};

use crate::fabric::{NodeCommand, NodeConnectionManager};
use crate::ledger::CreditLedger;
use crate::registry::{
    BillingState, BotInstance, BotInstanceRepository, Notification, NotificationRepository,
};
use crate::snapshots::keys;
use crate::types::{Clock, HelmsmanError, Result};

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Suspension-to-destruction grace period
    pub grace_period_ms: i64,
    /// Memory estimate used when reactivation has to re-place an instance
    pub default_estimate_mb: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 30 * 24 * 60 * 60 * 1000,
            default_estimate_mb: 100,
        }
    }
}

pub struct BotBilling {
    bots: Arc<dyn BotInstanceRepository>,
    fabric: Arc<NodeConnectionManager>,
    ledger: Arc<CreditLedger>,
    notifications: Arc<dyn NotificationRepository>,
    clock: Arc<dyn Clock>,
    config: BillingConfig,
}

impl BotBilling {
    pub fn new(
        bots: Arc<dyn BotInstanceRepository>,
        fabric: Arc<NodeConnectionManager>,
        ledger: Arc<CreditLedger>,
        notifications: Arc<dyn NotificationRepository>,
        clock: Arc<dyn Clock>,
        config: BillingConfig,
    ) -> Self {
        Self {
            bots,
            fabric,
            ledger,
            notifications,
            clock,
            config,
        }
    }

    /// Suspend every active instance of a tenant. Returns how many were
    /// suspended.
    pub async fn suspend_tenant(&self, tenant_id: &str, reason: &str) -> Result<usize> {
        let mut suspended = 0;
        for bot in self.bots.list_by_tenant(tenant_id).await? {
            if bot.billing_state == BillingState::Active {
                self.suspend_instance(&bot).await?;
                suspended += 1;
            }
        }
        if suspended > 0 {
            info!(tenant_id, suspended, reason, "Tenant workloads suspended");
            self.notify(tenant_id, "suspension", reason).await;
        }
        Ok(suspended)
    }

    /// Admin suspension of a single instance
    pub async fn suspend_instance_by_id(&self, bot_id: &str) -> Result<()> {
        let bot = self
            .bots
            .get(bot_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("bot {}", bot_id)))?;
        match bot.billing_state {
            BillingState::Active => self.suspend_instance(&bot).await,
            BillingState::Suspended => Ok(()),
            BillingState::Destroyed => Err(HelmsmanError::Conflict(format!(
                "cannot suspend destroyed instance {}",
                bot_id
            ))),
        }
    }

    async fn suspend_instance(&self, bot: &BotInstance) -> Result<()> {
        let now = self.clock.now_ms();
        self.bots
            .set_billing_state(
                &bot.id,
                BillingState::Suspended,
                Some(now),
                Some(now + self.config.grace_period_ms),
                now,
            )
            .await?;

        if let Some(ref node_id) = bot.node_id {
            if let Err(e) = self
                .fabric
                .send_command(node_id, NodeCommand::BotStop {
                    name: bot.container_name(),
                })
                .await
            {
                warn!(bot_id = %bot.id, node_id = %node_id, error = %e, "Suspension stop failed");
            }
        }
        Ok(())
    }

    /// Called on every credit arrival: while the balance is positive,
    /// reactivate all suspended instances still inside their grace period.
    /// Returns how many were reactivated.
    pub async fn check_reactivation(&self, tenant_id: &str) -> Result<usize> {
        if self.ledger.balance_cents(tenant_id).await? <= 0 {
            return Ok(0);
        }
        let now = self.clock.now_ms();
        let mut reactivated = 0;
        for bot in self.bots.list_by_tenant(tenant_id).await? {
            if bot.billing_state != BillingState::Suspended {
                continue;
            }
            // Past the grace deadline the sweeper owns the instance
            if bot.destroy_after.is_some_and(|d| now > d) {
                continue;
            }
            self.reactivate_instance(&bot).await?;
            reactivated += 1;
        }
        if reactivated > 0 {
            info!(tenant_id, reactivated, "Tenant workloads reactivated");
            self.notify(tenant_id, "reactivation", "credit balance restored")
                .await;
        }
        Ok(reactivated)
    }

    /// Admin reactivation, independent of the balance
    pub async fn admin_reactivate_tenant(&self, tenant_id: &str) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut reactivated = 0;
        for bot in self.bots.list_by_tenant(tenant_id).await? {
            if bot.billing_state == BillingState::Suspended
                && !bot.destroy_after.is_some_and(|d| now > d)
            {
                self.reactivate_instance(&bot).await?;
                reactivated += 1;
            }
        }
        Ok(reactivated)
    }

    async fn reactivate_instance(&self, bot: &BotInstance) -> Result<()> {
        let now = self.clock.now_ms();
        self.bots
            .set_billing_state(&bot.id, BillingState::Active, None, None, now)
            .await?;

        let start_result = match bot.node_id {
            Some(ref node_id) => self.start_on(bot, node_id, false).await,
            // Assignment was lost (its node died while suspended): place
            // fresh and restore from the hot backup
            None => self.place_and_restore(bot).await,
        };
        if let Err(e) = start_result {
            warn!(bot_id = %bot.id, error = %e, "Reactivation start failed; workload stays active-unplaced");
        }
        Ok(())
    }

    async fn start_on(&self, bot: &BotInstance, node_id: &str, restore: bool) -> Result<()> {
        if restore {
            self.fabric
                .send_command(node_id, NodeCommand::BackupDownload {
                    filename: keys::hot_backup(&bot.container_name()),
                })
                .await?;
            self.fabric
                .send_command(node_id, NodeCommand::BotImport {
                    name: bot.container_name(),
                    image: bot.image.clone(),
                    env: bot.env.clone(),
                })
                .await?;
        } else {
            self.fabric
                .send_command(node_id, NodeCommand::BotStart {
                    name: bot.container_name(),
                    image: bot.image.clone(),
                    env: bot.env.clone(),
                    restart: Some(true),
                })
                .await?;
        }
        Ok(())
    }

    async fn place_and_restore(&self, bot: &BotInstance) -> Result<()> {
        let estimate = self.config.default_estimate_mb;
        let target = self
            .fabric
            .find_best_target(None, estimate)
            .await?
            .ok_or_else(|| {
                HelmsmanError::NoCapacity(format!(
                    "no node can host reactivated workload {}",
                    bot.id
                ))
            })?;
        self.start_on(bot, &target.id, true).await?;
        self.fabric.reassign_tenant(&bot.id, &target.id).await?;
        self.fabric.adjust_used(&target.id, estimate as i64).await?;
        Ok(())
    }

    /// Grace-period sweep: destroy suspended instances past `destroy_after`.
    /// Idempotent; destroyed instances never come back.
    pub async fn destroy_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let expired = self.bots.list_suspended_expired(now).await?;
        let mut destroyed = 0;
        for bot in expired {
            self.bots
                .set_billing_state(
                    &bot.id,
                    BillingState::Destroyed,
                    bot.suspended_at,
                    bot.destroy_after,
                    now,
                )
                .await?;
            if let Some(ref node_id) = bot.node_id {
                if let Err(e) = self
                    .fabric
                    .send_command(node_id, NodeCommand::BotRemove {
                        name: bot.container_name(),
                    })
                    .await
                {
                    warn!(bot_id = %bot.id, node_id = %node_id, error = %e, "Destroy remove failed");
                }
            }
            self.fabric.unassign_tenant(&bot.id).await?;
            info!(bot_id = %bot.id, tenant_id = %bot.tenant_id, "Workload destroyed after grace period");
            destroyed += 1;
        }
        Ok(destroyed)
    }

    async fn notify(&self, tenant_id: &str, kind: &str, body: &str) {
        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            kind: kind.to_string(),
            body: body.to_string(),
            created_at: self.clock.now_ms(),
            sent_at: None,
        };
        if let Err(e) = self.notifications.enqueue(&notification).await {
            warn!(tenant_id, kind, error = %e, "Notification enqueue failed");
        }
    }
}
