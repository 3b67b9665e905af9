//! Bulk admin operations
//!
//! One bulk call covers up to the configured cap of tenant ids. Each
//! per-tenant operation is caught individually, so partial success is the
//! norm and the report carries both sides. Grants return an operation id
//! with a five-minute undo window; undo applies one compensating
//! `correction` per succeeded tenant, and a partially failed undo is
//! recorded as such rather than left silently re-undoable.

use std::sync::Arc;
use tracing::{info, warn};

use super::lifecycle::BotBilling;
use crate::ledger::{CreditLedger, TransactionType};
use crate::registry::{
    BotInstanceRepository, UndoGrantRepository, UndoStatus, UndoableGrant,
};
use crate::types::{Clock, HelmsmanError, Result, TimestampMs};

#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Maximum tenant ids per bulk call
    pub max_ids: usize,
    /// Undo window for grants
    pub undo_window_ms: i64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_ids: 500,
            undo_window_ms: 5 * 60 * 1000,
        }
    }
}

/// Requested bulk action
#[derive(Debug, Clone)]
pub enum BulkAction {
    Grant { amount_cents: i64 },
    Suspend,
    Reactivate,
    Export,
}

/// Per-tenant export row
#[derive(Debug, Clone, serde::Serialize)]
pub struct TenantExport {
    pub tenant_id: String,
    pub balance_cents: i64,
    pub instance_count: usize,
}

/// Bulk outcome; `operation_id`/`undo_deadline` only for grants
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BulkReport {
    pub operation_id: Option<String>,
    pub undo_deadline: Option<TimestampMs>,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub exported: Vec<TenantExport>,
}

/// Undo outcome
#[derive(Debug, Clone, serde::Serialize)]
pub struct UndoReport {
    pub operation_id: String,
    pub status: UndoStatus,
    pub corrected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct BulkOperations {
    ledger: Arc<CreditLedger>,
    billing: Arc<BotBilling>,
    bots: Arc<dyn BotInstanceRepository>,
    grants: Arc<dyn UndoGrantRepository>,
    clock: Arc<dyn Clock>,
    config: BulkConfig,
}

/// Tenant id validation applied before anything runs
fn validate_tenant_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(HelmsmanError::BadRequest(format!(
            "tenant id '{}' has invalid length",
            id
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(HelmsmanError::BadRequest(format!(
            "tenant id '{}' contains invalid characters",
            id
        )));
    }
    Ok(())
}

impl BulkOperations {
    pub fn new(
        ledger: Arc<CreditLedger>,
        billing: Arc<BotBilling>,
        bots: Arc<dyn BotInstanceRepository>,
        grants: Arc<dyn UndoGrantRepository>,
        clock: Arc<dyn Clock>,
        config: BulkConfig,
    ) -> Self {
        Self {
            ledger,
            billing,
            bots,
            grants,
            clock,
            config,
        }
    }

    pub async fn execute(&self, action: BulkAction, tenant_ids: &[String]) -> Result<BulkReport> {
        if tenant_ids.is_empty() {
            return Err(HelmsmanError::BadRequest("no tenant ids given".to_string()));
        }
        if tenant_ids.len() > self.config.max_ids {
            return Err(HelmsmanError::BadRequest(format!(
                "{} tenant ids exceeds the cap of {}",
                tenant_ids.len(),
                self.config.max_ids
            )));
        }
        for id in tenant_ids {
            validate_tenant_id(id)?;
        }
        if let BulkAction::Grant { amount_cents } = action {
            if amount_cents <= 0 {
                return Err(HelmsmanError::BadRequest(
                    "grant amount must be positive".to_string(),
                ));
            }
        }

        let mut report = BulkReport::default();
        let operation_id = uuid::Uuid::new_v4().to_string();

        for tenant_id in tenant_ids {
            let outcome = match &action {
                BulkAction::Grant { amount_cents } => self
                    .grant_one(&operation_id, tenant_id, *amount_cents)
                    .await,
                BulkAction::Suspend => self
                    .billing
                    .suspend_tenant(tenant_id, "bulk admin suspension")
                    .await
                    .map(|_| ()),
                BulkAction::Reactivate => self
                    .billing
                    .admin_reactivate_tenant(tenant_id)
                    .await
                    .map(|_| ()),
                BulkAction::Export => match self.export_one(tenant_id).await {
                    Ok(row) => {
                        report.exported.push(row);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };
            match outcome {
                Ok(()) => report.succeeded.push(tenant_id.clone()),
                Err(e) => report.failed.push((tenant_id.clone(), e.to_string())),
            }
        }

        if let BulkAction::Grant { amount_cents } = action {
            let now = self.clock.now_ms();
            let deadline = now + self.config.undo_window_ms;
            self.grants
                .insert(&UndoableGrant {
                    operation_id: operation_id.clone(),
                    tenant_ids: report.succeeded.clone(),
                    amount_cents,
                    deadline,
                    undo_status: UndoStatus::NotUndone,
                    failed_ids: Vec::new(),
                    created_at: now,
                })
                .await?;
            report.operation_id = Some(operation_id.clone());
            report.undo_deadline = Some(deadline);
            info!(
                operation_id = %operation_id,
                granted = report.succeeded.len(),
                failed = report.failed.len(),
                amount_cents,
                "Bulk grant recorded"
            );
        }

        Ok(report)
    }

    async fn grant_one(&self, operation_id: &str, tenant_id: &str, amount_cents: i64) -> Result<()> {
        let reference = format!("grant-{}-{}", operation_id, tenant_id);
        self.ledger
            .credit(
                tenant_id,
                amount_cents,
                TransactionType::Grant,
                &format!("bulk grant {}", operation_id),
                Some(&reference),
            )
            .await?;
        Ok(())
    }

    async fn export_one(&self, tenant_id: &str) -> Result<TenantExport> {
        Ok(TenantExport {
            tenant_id: tenant_id.to_string(),
            balance_cents: self.ledger.balance_cents(tenant_id).await?,
            instance_count: self.bots.list_by_tenant(tenant_id).await?.len(),
        })
    }

    /// Invert a grant inside its undo window. Every succeeded tenant gets a
    /// negative correction; a second undo (or one past the deadline) fails.
    pub async fn undo_grant(&self, operation_id: &str) -> Result<UndoReport> {
        let grant = self
            .grants
            .get(operation_id)
            .await?
            .ok_or_else(|| HelmsmanError::NotFound(format!("bulk operation {}", operation_id)))?;

        match grant.undo_status {
            UndoStatus::NotUndone => {}
            UndoStatus::Undone => {
                return Err(HelmsmanError::Conflict(format!(
                    "operation {} already undone",
                    operation_id
                )));
            }
            UndoStatus::Partial => {
                return Err(HelmsmanError::Conflict(format!(
                    "operation {} has a recorded partial undo",
                    operation_id
                )));
            }
        }

        let now = self.clock.now_ms();
        if now > grant.deadline {
            return Err(HelmsmanError::BadRequest(format!(
                "undo window for {} elapsed",
                operation_id
            )));
        }

        let mut corrected = Vec::new();
        let mut failed = Vec::new();
        for tenant_id in &grant.tenant_ids {
            let reference = format!("undo-{}-{}", operation_id, tenant_id);
            match self
                .ledger
                .correct(
                    tenant_id,
                    -grant.amount_cents,
                    &format!("undo of bulk grant {}", operation_id),
                    Some(&reference),
                )
                .await
            {
                Ok(_) => corrected.push(tenant_id.clone()),
                Err(e) => {
                    warn!(
                        operation_id,
                        tenant_id = %tenant_id,
                        error = %e,
                        "Undo correction failed"
                    );
                    failed.push((tenant_id.clone(), e.to_string()));
                }
            }
        }

        let failed_ids: Vec<String> = failed.iter().map(|(id, _)| id.clone()).collect();
        let status = if failed.is_empty() {
            UndoStatus::Undone
        } else {
            UndoStatus::Partial
        };
        self.grants
            .set_undo_status(operation_id, status, &failed_ids)
            .await?;
        info!(
            operation_id,
            corrected = corrected.len(),
            failed = failed.len(),
            status = status.as_str(),
            "Bulk grant undo finished"
        );

        Ok(UndoReport {
            operation_id: operation_id.to_string(),
            status,
            corrected,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_validation() {
        assert!(validate_tenant_id("tenant-1").is_ok());
        assert!(validate_tenant_id("t.2:prod_x").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("bad id").is_err());
        assert!(validate_tenant_id(&"x".repeat(65)).is_err());
    }
}
