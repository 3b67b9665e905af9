//! Rolling-spend budget checker for admission control
//!
//! Keeps a short-TTL cache of per-tenant hourly and monthly retail spend so
//! the hot request path does not hit the meter tables on every call. The
//! cache is invalidated explicitly on meter updates and lapses on its own
//! after the TTL.

use dashmap::DashMap;
use std::sync::Arc;

use super::meter::MeterRepository;
use crate::registry::TenantCustomerRepository;
use crate::types::{Clock, HelmsmanError, Result, TimestampMs};

const HOUR_MS: i64 = 60 * 60 * 1000;
const MONTH_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Cached spend snapshot
#[derive(Debug, Clone, Copy)]
struct CachedSpend {
    hourly_cents: i64,
    monthly_cents: i64,
    computed_at: TimestampMs,
}

/// Rolling spend for a tenant, exposed for status surfaces
#[derive(Debug, Clone, Copy)]
pub struct SpendWindows {
    pub hourly_cents: i64,
    pub monthly_cents: i64,
}

pub struct BudgetChecker {
    meter: Arc<dyn MeterRepository>,
    customers: Arc<dyn TenantCustomerRepository>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    cache: DashMap<String, CachedSpend>,
}

impl BudgetChecker {
    pub fn new(
        meter: Arc<dyn MeterRepository>,
        customers: Arc<dyn TenantCustomerRepository>,
        clock: Arc<dyn Clock>,
        ttl_ms: i64,
    ) -> Self {
        Self {
            meter,
            customers,
            clock,
            ttl_ms,
            cache: DashMap::new(),
        }
    }

    /// Drop the cached windows for a tenant (called on meter updates)
    pub fn invalidate(&self, tenant_id: &str) {
        self.cache.remove(tenant_id);
    }

    /// Current rolling spend, served from cache inside the TTL
    pub async fn spend(&self, tenant_id: &str) -> Result<SpendWindows> {
        let now = self.clock.now_ms();
        if let Some(cached) = self.cache.get(tenant_id) {
            if now - cached.computed_at < self.ttl_ms {
                return Ok(SpendWindows {
                    hourly_cents: cached.hourly_cents,
                    monthly_cents: cached.monthly_cents,
                });
            }
        }

        let hourly = self
            .meter
            .spend_between(tenant_id, now - HOUR_MS, now)
            .await?
            .to_cents_rounded();
        let monthly = self
            .meter
            .spend_between(tenant_id, now - MONTH_MS, now)
            .await?
            .to_cents_rounded();

        self.cache.insert(
            tenant_id.to_string(),
            CachedSpend {
                hourly_cents: hourly,
                monthly_cents: monthly,
                computed_at: now,
            },
        );
        Ok(SpendWindows {
            hourly_cents: hourly,
            monthly_cents: monthly,
        })
    }

    /// Admission check against the tenant's caps. A missing cap means
    /// unlimited; a breach maps to HTTP 429.
    pub async fn check(&self, tenant_id: &str) -> Result<()> {
        let customer = self.customers.get(tenant_id).await?;
        let (hourly_cap, monthly_cap) = match customer {
            Some(c) => (c.hourly_cap_cents, c.monthly_cap_cents),
            None => (None, None),
        };
        if hourly_cap.is_none() && monthly_cap.is_none() {
            return Ok(());
        }

        let spend = self.spend(tenant_id).await?;
        if let Some(cap) = hourly_cap {
            if spend.hourly_cents >= cap {
                return Err(HelmsmanError::BudgetExceeded(format!(
                    "hourly spend {}c at cap {}c",
                    spend.hourly_cents, cap
                )));
            }
        }
        if let Some(cap) = monthly_cap {
            if spend.monthly_cents >= cap {
                return Err(HelmsmanError::BudgetExceeded(format!(
                    "monthly spend {}c at cap {}c",
                    spend.monthly_cents, cap
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::meter::{MemoryMeterRepository, MeterEvent};
    use crate::registry::{MemoryTenantCustomerRepository, TenantCustomer};
    use crate::types::{Credits, ManualClock};

    async fn setup(
        hourly_cap: Option<i64>,
    ) -> (BudgetChecker, Arc<MemoryMeterRepository>, Arc<ManualClock>) {
        let meter = Arc::new(MemoryMeterRepository::new());
        let customers = Arc::new(MemoryTenantCustomerRepository::new());
        customers
            .upsert(&TenantCustomer {
                tenant_id: "t1".to_string(),
                processor_customer_id: None,
                topup_enabled: false,
                topup_threshold_cents: None,
                topup_amount_cents: None,
                topup_failures: 0,
                hourly_cap_cents: hourly_cap,
                monthly_cap_cents: None,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        let clock = ManualClock::new(10 * HOUR_MS);
        let checker = BudgetChecker::new(meter.clone(), customers, clock.clone(), 1_000);
        (checker, meter, clock)
    }

    fn usage(id: &str, cents: i64, ts: i64) -> MeterEvent {
        MeterEvent {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            cost: Credits::from_cents(cents / 2),
            charge: Credits::from_cents(cents),
            capability: "chat".to_string(),
            provider: "upstream".to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_cap_breach_and_invalidation() {
        let (checker, meter, clock) = setup(Some(100)).await;
        assert!(checker.check("t1").await.is_ok());

        meter.insert(&usage("e1", 100, clock.now_ms())).await.unwrap();
        // Stale cache still admits until invalidated
        assert!(checker.check("t1").await.is_ok());
        checker.invalidate("t1");
        assert!(matches!(
            checker.check("t1").await,
            Err(HelmsmanError::BudgetExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_expires_on_ttl() {
        let (checker, meter, clock) = setup(Some(100)).await;
        assert!(checker.check("t1").await.is_ok());
        meter.insert(&usage("e1", 100, clock.now_ms())).await.unwrap();
        clock.advance(1_001);
        assert!(checker.check("t1").await.is_err());
    }

    #[tokio::test]
    async fn test_unlimited_without_caps() {
        let (checker, meter, clock) = setup(None).await;
        meter
            .insert(&usage("e1", 1_000_000, clock.now_ms()))
            .await
            .unwrap();
        assert!(checker.check("t1").await.is_ok());
    }
}
