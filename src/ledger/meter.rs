//! Metering intake
//!
//! The gateway reports one `MeterEvent` per upstream call: `cost` is the
//! wholesale amount, `charge` the retail amount with margin. Events are
//! persisted raw at nanodollar precision, periodically rolled up into hourly
//! usage summaries, and charged to the ledger as `usage` debits keyed by the
//! event id (replays are no-ops).

use async_trait::async_trait;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CreditLedger, TransactionType};
use crate::db::Db;
use crate::ledger::budget::BudgetChecker;
use crate::types::{Credits, HelmsmanError, Result, TimestampMs};

/// Milliseconds per aggregation bucket (one hour)
pub const BUCKET_MS: i64 = 60 * 60 * 1000;

/// Align a timestamp to its bucket start
pub fn bucket_start(ts_ms: TimestampMs) -> TimestampMs {
    ts_ms - ts_ms.rem_euclid(BUCKET_MS)
}

/// One metered upstream call
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MeterEvent {
    pub id: String,
    pub tenant_id: String,
    /// Wholesale cost
    pub cost: Credits,
    /// Retail charge with margin
    pub charge: Credits,
    pub capability: String,
    pub provider: String,
    pub timestamp: TimestampMs,
}

#[async_trait]
pub trait MeterRepository: Send + Sync {
    async fn insert(&self, event: &MeterEvent) -> Result<()>;

    /// Retail spend inside `[from, to]`, summed over raw events and any
    /// summary buckets overlapping the window
    async fn spend_between(
        &self,
        tenant_id: &str,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Credits>;

    /// Roll raw events older than `cutoff` into hourly summaries and delete
    /// them. Returns how many events were aggregated.
    async fn aggregate_before(&self, cutoff: TimestampMs) -> Result<usize>;
}

// =============================================================================
// SQLite implementation
// =============================================================================

pub struct SqliteMeterRepository {
    db: Db,
}

impl SqliteMeterRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MeterRepository for SqliteMeterRepository {
    async fn insert(&self, event: &MeterEvent) -> Result<()> {
        let e = event.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO meter_events (id, tenant_id, cost_nanos, charge_nanos, \
                     capability, provider, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        e.id,
                        e.tenant_id,
                        e.cost.nanos(),
                        e.charge.nanos(),
                        e.capability,
                        e.provider,
                        e.timestamp
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn spend_between(
        &self,
        tenant_id: &str,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Credits> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with(move |conn| {
                let raw: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(charge_nanos), 0) FROM meter_events \
                     WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at <= ?3",
                    params![tenant_id, from, to],
                    |r| r.get(0),
                )?;
                let summarized: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(charge_nanos), 0) FROM usage_summaries \
                     WHERE tenant_id = ?1 AND bucket_start + ?4 > ?2 AND bucket_start <= ?3",
                    params![tenant_id, from, to, BUCKET_MS],
                    |r| r.get(0),
                )?;
                Ok(Credits::from_nanos(raw + summarized))
            })
            .await
    }

    async fn aggregate_before(&self, cutoff: TimestampMs) -> Result<usize> {
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                let mut count = 0usize;
                {
                    let mut stmt = tx.prepare(
                        "SELECT tenant_id, created_at, cost_nanos, charge_nanos \
                         FROM meter_events WHERE created_at < ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![cutoff], |r| {
                            Ok((
                                r.get::<_, String>(0)?,
                                r.get::<_, i64>(1)?,
                                r.get::<_, i64>(2)?,
                                r.get::<_, i64>(3)?,
                            ))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;

                    for (tenant, created_at, cost, charge) in rows {
                        tx.execute(
                            "INSERT INTO usage_summaries (tenant_id, bucket_start, \
                             charge_nanos, cost_nanos, event_count) VALUES (?1, ?2, ?3, ?4, 1) \
                             ON CONFLICT (tenant_id, bucket_start) DO UPDATE SET \
                             charge_nanos = charge_nanos + ?3, cost_nanos = cost_nanos + ?4, \
                             event_count = event_count + 1",
                            params![tenant, bucket_start(created_at), charge, cost],
                        )?;
                        count += 1;
                    }
                }
                tx.execute("DELETE FROM meter_events WHERE created_at < ?1", params![cutoff])?;
                tx.commit()?;
                Ok(count)
            })
            .await
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
pub struct MemoryMeterRepository {
    state: Mutex<MemoryMeterState>,
}

#[derive(Default)]
struct MemoryMeterState {
    events: Vec<MeterEvent>,
    summaries: HashMap<(String, TimestampMs), (i64, i64, u64)>,
}

impl MemoryMeterRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeterRepository for MemoryMeterRepository {
    async fn insert(&self, event: &MeterEvent) -> Result<()> {
        self.state.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn spend_between(
        &self,
        tenant_id: &str,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Credits> {
        let state = self.state.lock().await;
        let raw: i64 = state
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.timestamp >= from && e.timestamp <= to)
            .map(|e| e.charge.nanos())
            .sum();
        let summarized: i64 = state
            .summaries
            .iter()
            .filter(|((tenant, bucket), _)| {
                tenant == tenant_id && bucket + BUCKET_MS > from && *bucket <= to
            })
            .map(|(_, (charge, _, _))| *charge)
            .sum();
        Ok(Credits::from_nanos(raw + summarized))
    }

    async fn aggregate_before(&self, cutoff: TimestampMs) -> Result<usize> {
        let mut state = self.state.lock().await;
        let (old, keep): (Vec<_>, Vec<_>) = state
            .events
            .drain(..)
            .partition(|e| e.timestamp < cutoff);
        let count = old.len();
        for event in old {
            let entry = state
                .summaries
                .entry((event.tenant_id.clone(), bucket_start(event.timestamp)))
                .or_insert((0, 0, 0));
            entry.0 += event.charge.nanos();
            entry.1 += event.cost.nanos();
            entry.2 += 1;
        }
        state.events = keep;
        Ok(count)
    }
}

// =============================================================================
// Intake service
// =============================================================================

/// Records meter events, debits the ledger, keeps spend caches honest
pub struct MeterIngest {
    meter: Arc<dyn MeterRepository>,
    ledger: Arc<CreditLedger>,
    budget: Arc<BudgetChecker>,
}

impl MeterIngest {
    pub fn new(
        meter: Arc<dyn MeterRepository>,
        ledger: Arc<CreditLedger>,
        budget: Arc<BudgetChecker>,
    ) -> Self {
        Self {
            meter,
            ledger,
            budget,
        }
    }

    /// Persist one metering event and charge it against the tenant.
    ///
    /// The ledger is cents-only: the retail charge is rounded half away from
    /// zero at this boundary, while the raw tables keep nanodollar precision
    /// for spend windows. A replayed event id leaves the ledger untouched.
    pub async fn record(&self, event: MeterEvent) -> Result<()> {
        if event.tenant_id.is_empty() {
            return Err(HelmsmanError::BadRequest(
                "meter event missing tenant".to_string(),
            ));
        }
        if event.charge.is_negative() || event.cost.is_negative() {
            return Err(HelmsmanError::BadRequest(
                "meter amounts must be non-negative".to_string(),
            ));
        }

        self.meter.insert(&event).await?;

        let charge_cents = event.charge.to_cents_rounded();
        if charge_cents > 0 {
            let reference = format!("meter-{}", event.id);
            self.ledger
                .debit(
                    &event.tenant_id,
                    charge_cents,
                    TransactionType::Usage,
                    &format!("{} via {}", event.capability, event.provider),
                    Some(&reference),
                )
                .await?;
        } else {
            debug!(
                tenant_id = %event.tenant_id,
                nanos = event.charge.nanos(),
                "Sub-cent meter event recorded without ledger debit"
            );
        }

        self.budget.invalidate(&event.tenant_id);
        Ok(())
    }
}
