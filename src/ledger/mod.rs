//! Credit ledger
//!
//! Append-only transaction log plus a materialized per-tenant balance. Both
//! writes happen inside one database transaction, so the invariant
//! `balance(t) = Σ amounts(t)` holds at every commit point. A unique
//! `reference_id` makes externally-sourced credits and debits exactly-once:
//! a replayed reference returns the original row and changes nothing.

pub mod budget;
pub mod meter;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::db::Db;
use crate::types::{Clock, HelmsmanError, Result, TimestampMs};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    Usage,
    Grant,
    Refund,
    Correction,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Usage => "usage",
            Self::Grant => "grant",
            Self::Refund => "refund",
            Self::Correction => "correction",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "usage" => Ok(Self::Usage),
            "grant" => Ok(Self::Grant),
            "refund" => Ok(Self::Refund),
            "correction" => Ok(Self::Correction),
            other => Err(HelmsmanError::Database(format!(
                "unknown transaction type '{}'",
                other
            ))),
        }
    }
}

/// One ledger row. `amount_cents` is signed: positive credit, negative debit.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub tenant_id: String,
    pub amount_cents: i64,
    pub balance_after_cents: i64,
    pub tx_type: TransactionType,
    pub description: String,
    pub reference_id: Option<String>,
    pub created_at: TimestampMs,
}

/// Outcome of applying a ledger mutation
#[derive(Debug, Clone)]
pub struct Applied {
    pub transaction: CreditTransaction,
    /// True when a duplicate reference id made this call a no-op
    pub replayed: bool,
}

/// Balance-changing event published to billing
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Credited {
        tenant_id: String,
        amount_cents: i64,
        balance_after_cents: i64,
    },
    Debited {
        tenant_id: String,
        amount_cents: i64,
        balance_after_cents: i64,
    },
}

// =============================================================================
// Store
// =============================================================================

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append a transaction and update the materialized balance atomically.
    /// A duplicate `reference_id` returns the pre-existing transaction.
    async fn apply(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        description: &str,
        reference_id: Option<&str>,
        now: TimestampMs,
    ) -> Result<Applied>;

    async fn balance_cents(&self, tenant_id: &str) -> Result<i64>;

    async fn transactions(&self, tenant_id: &str) -> Result<Vec<CreditTransaction>>;
}

pub struct SqliteLedgerStore {
    db: Db,
}

impl SqliteLedgerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

const TX_COLUMNS: &str =
    "id, tenant_id, amount_cents, balance_after_cents, tx_type, description, reference_id, \
     created_at";

type TxRow = (String, String, i64, i64, String, String, Option<String>, i64);

fn read_tx_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TxRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn tx_from_row(row: TxRow) -> Result<CreditTransaction> {
    Ok(CreditTransaction {
        id: row.0,
        tenant_id: row.1,
        amount_cents: row.2,
        balance_after_cents: row.3,
        tx_type: TransactionType::parse(&row.4)?,
        description: row.5,
        reference_id: row.6,
        created_at: row.7,
    })
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn apply(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        description: &str,
        reference_id: Option<&str>,
        now: TimestampMs,
    ) -> Result<Applied> {
        let tenant_id = tenant_id.to_string();
        let description = description.to_string();
        let reference_id = reference_id.map(|s| s.to_string());
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;

                if let Some(ref reference) = reference_id {
                    let existing: Option<TxRow> = tx
                        .query_row(
                            &format!(
                                "SELECT {} FROM credit_transactions WHERE reference_id = ?1",
                                TX_COLUMNS
                            ),
                            params![reference],
                            read_tx_row,
                        )
                        .optional()?;
                    if let Some(row) = existing {
                        return Ok(Applied {
                            transaction: tx_from_row(row)?,
                            replayed: true,
                        });
                    }
                }

                let balance: i64 = tx
                    .query_row(
                        "SELECT balance_cents FROM credit_balances WHERE tenant_id = ?1",
                        params![tenant_id],
                        |r| r.get(0),
                    )
                    .optional()?
                    .unwrap_or(0);
                let balance_after = balance + amount_cents;

                tx.execute(
                    "INSERT INTO credit_transactions (id, tenant_id, amount_cents, \
                     balance_after_cents, tx_type, description, reference_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id,
                        tenant_id,
                        amount_cents,
                        balance_after,
                        tx_type.as_str(),
                        description,
                        reference_id,
                        now
                    ],
                )?;
                tx.execute(
                    "INSERT INTO credit_balances (tenant_id, balance_cents, updated_at) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT (tenant_id) DO UPDATE SET balance_cents = ?2, updated_at = ?3",
                    params![tenant_id, balance_after, now],
                )?;
                tx.commit()?;

                Ok(Applied {
                    transaction: CreditTransaction {
                        id,
                        tenant_id,
                        amount_cents,
                        balance_after_cents: balance_after,
                        tx_type,
                        description,
                        reference_id,
                        created_at: now,
                    },
                    replayed: false,
                })
            })
            .await
    }

    async fn balance_cents(&self, tenant_id: &str) -> Result<i64> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT balance_cents FROM credit_balances WHERE tenant_id = ?1",
                        params![tenant_id],
                        |r| r.get(0),
                    )
                    .optional()?
                    .unwrap_or(0))
            })
            .await
    }

    async fn transactions(&self, tenant_id: &str) -> Result<Vec<CreditTransaction>> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM credit_transactions WHERE tenant_id = ?1 \
                     ORDER BY created_at, id",
                    TX_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![tenant_id], read_tx_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(tx_from_row).collect()
            })
            .await
    }
}

/// In-memory ledger store with the same atomicity contract
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryLedgerState>,
}

#[derive(Default)]
struct MemoryLedgerState {
    transactions: Vec<CreditTransaction>,
    balances: HashMap<String, i64>,
    by_reference: HashMap<String, usize>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn apply(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        description: &str,
        reference_id: Option<&str>,
        now: TimestampMs,
    ) -> Result<Applied> {
        let mut state = self.state.lock().await;

        if let Some(reference) = reference_id {
            if let Some(&idx) = state.by_reference.get(reference) {
                return Ok(Applied {
                    transaction: state.transactions[idx].clone(),
                    replayed: true,
                });
            }
        }

        let balance_after = state.balances.get(tenant_id).copied().unwrap_or(0) + amount_cents;
        let transaction = CreditTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            amount_cents,
            balance_after_cents: balance_after,
            tx_type,
            description: description.to_string(),
            reference_id: reference_id.map(|s| s.to_string()),
            created_at: now,
        };

        let index = state.transactions.len();
        if let Some(reference) = reference_id {
            state.by_reference.insert(reference.to_string(), index);
        }
        state.transactions.push(transaction.clone());
        state.balances.insert(tenant_id.to_string(), balance_after);

        Ok(Applied {
            transaction,
            replayed: false,
        })
    }

    async fn balance_cents(&self, tenant_id: &str) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(tenant_id)
            .copied()
            .unwrap_or(0))
    }

    async fn transactions(&self, tenant_id: &str) -> Result<Vec<CreditTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .iter()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Ledger service
// =============================================================================

/// Capacity of the ledger event channel; billing consumes promptly
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The single writer for tenant balances
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<LedgerEvent>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            clock,
            events,
        }
    }

    /// Subscribe to balance-changing events
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Add credit. `amount_cents` must be positive.
    pub async fn credit(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Applied> {
        if amount_cents <= 0 {
            return Err(HelmsmanError::BadRequest(format!(
                "credit amount must be positive, got {}",
                amount_cents
            )));
        }
        let applied = self
            .store
            .apply(
                tenant_id,
                amount_cents,
                tx_type,
                description,
                reference_id,
                self.clock.now_ms(),
            )
            .await?;
        if !applied.replayed {
            let _ = self.events.send(LedgerEvent::Credited {
                tenant_id: tenant_id.to_string(),
                amount_cents,
                balance_after_cents: applied.transaction.balance_after_cents,
            });
        } else {
            debug!(tenant_id, reference_id = ?reference_id, "Replayed credit ignored");
        }
        Ok(applied)
    }

    /// Remove credit. `amount_cents` must be positive; stored negated.
    /// The balance may go to or below zero; billing reacts to the event.
    pub async fn debit(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Applied> {
        if amount_cents <= 0 {
            return Err(HelmsmanError::BadRequest(format!(
                "debit amount must be positive, got {}",
                amount_cents
            )));
        }
        let applied = self
            .store
            .apply(
                tenant_id,
                -amount_cents,
                tx_type,
                description,
                reference_id,
                self.clock.now_ms(),
            )
            .await?;
        if !applied.replayed {
            let _ = self.events.send(LedgerEvent::Debited {
                tenant_id: tenant_id.to_string(),
                amount_cents,
                balance_after_cents: applied.transaction.balance_after_cents,
            });
        } else {
            debug!(tenant_id, reference_id = ?reference_id, "Replayed debit ignored");
        }
        Ok(applied)
    }

    /// Apply a signed correction (used by bulk undo)
    pub async fn correct(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Applied> {
        if amount_cents == 0 {
            return Err(HelmsmanError::BadRequest(
                "correction amount must be non-zero".to_string(),
            ));
        }
        let applied = self
            .store
            .apply(
                tenant_id,
                amount_cents,
                TransactionType::Correction,
                description,
                reference_id,
                self.clock.now_ms(),
            )
            .await?;
        if !applied.replayed {
            let event = if amount_cents > 0 {
                LedgerEvent::Credited {
                    tenant_id: tenant_id.to_string(),
                    amount_cents,
                    balance_after_cents: applied.transaction.balance_after_cents,
                }
            } else {
                LedgerEvent::Debited {
                    tenant_id: tenant_id.to_string(),
                    amount_cents: -amount_cents,
                    balance_after_cents: applied.transaction.balance_after_cents,
                }
            };
            let _ = self.events.send(event);
        }
        Ok(applied)
    }

    pub async fn balance_cents(&self, tenant_id: &str) -> Result<i64> {
        self.store.balance_cents(tenant_id).await
    }

    pub async fn transactions(&self, tenant_id: &str) -> Result<Vec<CreditTransaction>> {
        self.store.transactions(tenant_id).await
    }
}
