//! Auto-topup
//!
//! A tenant may configure a threshold and amount: when a debit drops the
//! balance below the threshold and no charge is already in flight, one
//! charge is attempted through the external payment processor. Consecutive
//! failures past the ceiling disable the feature and notify the tenant.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::{CreditLedger, TransactionType};
use crate::registry::{Notification, NotificationRepository, TenantCustomerRepository};
use crate::types::{Clock, Result};

/// External payment processor, specified by interface only
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn charge(&self, customer_id: &str, amount_cents: i64) -> Result<ChargeReceipt>;
}

/// Successful charge outcome
#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    /// Processor-side charge id, used as the ledger reference
    pub charge_id: String,
}

#[derive(Debug, Clone)]
pub struct TopupConfig {
    /// Consecutive failures before auto-topup is disabled
    pub max_failures: u32,
}

impl Default for TopupConfig {
    fn default() -> Self {
        Self { max_failures: 3 }
    }
}

pub struct AutoTopup {
    customers: Arc<dyn TenantCustomerRepository>,
    ledger: Arc<CreditLedger>,
    notifications: Arc<dyn NotificationRepository>,
    processor: Arc<dyn PaymentProcessor>,
    clock: Arc<dyn Clock>,
    config: TopupConfig,
    /// Tenants with a charge currently in flight
    in_flight: DashSet<String>,
}

impl AutoTopup {
    pub fn new(
        customers: Arc<dyn TenantCustomerRepository>,
        ledger: Arc<CreditLedger>,
        notifications: Arc<dyn NotificationRepository>,
        processor: Arc<dyn PaymentProcessor>,
        clock: Arc<dyn Clock>,
        config: TopupConfig,
    ) -> Self {
        Self {
            customers,
            ledger,
            notifications,
            processor,
            clock,
            config,
            in_flight: DashSet::new(),
        }
    }

    /// Evaluate a tenant after a debit. Returns true when a charge was
    /// attempted (successfully or not).
    pub async fn on_debit(&self, tenant_id: &str, balance_after_cents: i64) -> Result<bool> {
        let Some(customer) = self.customers.get(tenant_id).await? else {
            return Ok(false);
        };
        let (Some(threshold), Some(amount), Some(customer_id)) = (
            customer.topup_threshold_cents,
            customer.topup_amount_cents,
            customer.processor_customer_id.clone(),
        ) else {
            return Ok(false);
        };
        if !customer.topup_enabled || balance_after_cents >= threshold {
            return Ok(false);
        }
        if !self.in_flight.insert(tenant_id.to_string()) {
            // A charge is already in flight for this tenant
            return Ok(false);
        }

        let outcome = self.attempt_charge(tenant_id, &customer_id, amount).await;
        self.in_flight.remove(tenant_id);

        if let Err(e) = outcome {
            let now = self.clock.now_ms();
            let failures = customer.topup_failures + 1;
            let disable = failures >= self.config.max_failures;
            warn!(
                tenant_id,
                failures,
                disable,
                error = %e,
                "Auto-topup charge failed"
            );
            self.customers
                .record_topup_attempt(tenant_id, false, disable, now)
                .await?;
            if disable {
                let notification = Notification {
                    id: uuid::Uuid::new_v4().to_string(),
                    tenant_id: tenant_id.to_string(),
                    kind: "topup_disabled".to_string(),
                    body: format!(
                        "auto-topup disabled after {} consecutive failed charges",
                        failures
                    ),
                    created_at: now,
                    sent_at: None,
                };
                if let Err(e) = self.notifications.enqueue(&notification).await {
                    warn!(tenant_id, error = %e, "Topup notification enqueue failed");
                }
            }
        }
        Ok(true)
    }

    async fn attempt_charge(
        &self,
        tenant_id: &str,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<()> {
        let receipt = self.processor.charge(customer_id, amount_cents).await?;
        // The processor charge id is the idempotency key: a webhook replay
        // of the same charge cannot double-credit
        let reference = format!("topup-{}", receipt.charge_id);
        self.ledger
            .credit(
                tenant_id,
                amount_cents,
                TransactionType::Purchase,
                "auto-topup",
                Some(&reference),
            )
            .await?;
        self.customers
            .record_topup_attempt(tenant_id, true, false, self.clock.now_ms())
            .await?;
        info!(tenant_id, amount_cents, charge_id = %receipt.charge_id, "Auto-topup applied");
        Ok(())
    }
}
