//! Credit-backed workload billing
//!
//! - `lifecycle` - the active/suspended/destroyed state machine
//! - `topup` - threshold-triggered charges through the payment processor
//! - `bulk` - admin bulk operations with the grant undo window
//!
//! The ledger event stream is the glue: debits that zero a balance suspend,
//! credits that restore it reactivate, and debits below the topup threshold
//! kick off a charge.

pub mod bulk;
pub mod lifecycle;
pub mod topup;

pub use bulk::{BulkAction, BulkConfig, BulkOperations, BulkReport, TenantExport, UndoReport};
pub use lifecycle::{BillingConfig, BotBilling};
pub use topup::{AutoTopup, ChargeReceipt, PaymentProcessor, TopupConfig};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::ledger::{CreditLedger, LedgerEvent};

/// Wire billing to the ledger's event stream.
///
/// Background consumer; failures are logged and the stream continues, since
/// the durable billing state can always be reconciled by the sweeps.
pub fn spawn_ledger_listener(
    ledger: Arc<CreditLedger>,
    billing: Arc<BotBilling>,
    topup: Option<Arc<AutoTopup>>,
) -> JoinHandle<()> {
    let mut rx = ledger.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(LedgerEvent::Credited { tenant_id, .. }) => {
                    if let Err(e) = billing.check_reactivation(&tenant_id).await {
                        error!(tenant_id = %tenant_id, error = %e, "Reactivation check failed");
                    }
                }
                Ok(LedgerEvent::Debited {
                    tenant_id,
                    balance_after_cents,
                    ..
                }) => {
                    if balance_after_cents <= 0 {
                        if let Err(e) = billing
                            .suspend_tenant(&tenant_id, "credit balance exhausted")
                            .await
                        {
                            error!(tenant_id = %tenant_id, error = %e, "Zero-balance suspension failed");
                        }
                    }
                    if let Some(ref topup) = topup {
                        if let Err(e) = topup.on_debit(&tenant_id, balance_after_cents).await {
                            error!(tenant_id = %tenant_id, error = %e, "Auto-topup evaluation failed");
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Billing listener lagged behind the ledger stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
