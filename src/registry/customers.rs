//! Tenant customer repository: payment linkage, auto-topup settings,
//! admission caps.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::models::TenantCustomer;
use crate::db::Db;
use crate::types::{Result, TimestampMs};

#[async_trait]
pub trait TenantCustomerRepository: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantCustomer>>;

    async fn upsert(&self, customer: &TenantCustomer) -> Result<()>;

    /// Record the outcome of an auto-topup charge attempt. A success resets
    /// the failure streak; `disable` turns the feature off.
    async fn record_topup_attempt(
        &self,
        tenant_id: &str,
        success: bool,
        disable: bool,
        now: TimestampMs,
    ) -> Result<()>;
}

// =============================================================================
// SQLite implementation
// =============================================================================

pub struct SqliteTenantCustomerRepository {
    db: Db,
}

impl SqliteTenantCustomerRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

const CUSTOMER_COLUMNS: &str = "tenant_id, processor_customer_id, topup_enabled, \
     topup_threshold_cents, topup_amount_cents, topup_failures, hourly_cap_cents, \
     monthly_cap_cents, created_at, updated_at";

type CustomerRow = (
    String,
    Option<String>,
    i64,
    Option<i64>,
    Option<i64>,
    i64,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
);

fn read_customer_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CustomerRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
    ))
}

fn customer_from_row(row: CustomerRow) -> TenantCustomer {
    TenantCustomer {
        tenant_id: row.0,
        processor_customer_id: row.1,
        topup_enabled: row.2 != 0,
        topup_threshold_cents: row.3,
        topup_amount_cents: row.4,
        topup_failures: row.5.max(0) as u32,
        hourly_cap_cents: row.6,
        monthly_cap_cents: row.7,
        created_at: row.8,
        updated_at: row.9,
    }
}

#[async_trait]
impl TenantCustomerRepository for SqliteTenantCustomerRepository {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantCustomer>> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM tenant_customers WHERE tenant_id = ?1",
                            CUSTOMER_COLUMNS
                        ),
                        params![tenant_id],
                        read_customer_row,
                    )
                    .optional()?
                    .map(customer_from_row))
            })
            .await
    }

    async fn upsert(&self, customer: &TenantCustomer) -> Result<()> {
        let c = customer.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO tenant_customers (tenant_id, processor_customer_id, \
                     topup_enabled, topup_threshold_cents, topup_amount_cents, topup_failures, \
                     hourly_cap_cents, monthly_cap_cents, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT (tenant_id) DO UPDATE SET \
                     processor_customer_id = ?2, topup_enabled = ?3, \
                     topup_threshold_cents = ?4, topup_amount_cents = ?5, \
                     topup_failures = ?6, hourly_cap_cents = ?7, monthly_cap_cents = ?8, \
                     updated_at = ?10",
                    params![
                        c.tenant_id,
                        c.processor_customer_id,
                        c.topup_enabled as i64,
                        c.topup_threshold_cents,
                        c.topup_amount_cents,
                        c.topup_failures as i64,
                        c.hourly_cap_cents,
                        c.monthly_cap_cents,
                        c.created_at,
                        c.updated_at
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn record_topup_attempt(
        &self,
        tenant_id: &str,
        success: bool,
        disable: bool,
        now: TimestampMs,
    ) -> Result<()> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with(move |conn| {
                if success {
                    conn.execute(
                        "UPDATE tenant_customers SET topup_failures = 0, updated_at = ?2 \
                         WHERE tenant_id = ?1",
                        params![tenant_id, now],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE tenant_customers SET topup_failures = topup_failures + 1, \
                         topup_enabled = CASE WHEN ?2 THEN 0 ELSE topup_enabled END, \
                         updated_at = ?3 WHERE tenant_id = ?1",
                        params![tenant_id, disable, now],
                    )?;
                }
                Ok(())
            })
            .await
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
pub struct MemoryTenantCustomerRepository {
    customers: Mutex<HashMap<String, TenantCustomer>>,
}

impl MemoryTenantCustomerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantCustomerRepository for MemoryTenantCustomerRepository {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantCustomer>> {
        Ok(self.customers.lock().await.get(tenant_id).cloned())
    }

    async fn upsert(&self, customer: &TenantCustomer) -> Result<()> {
        self.customers
            .lock()
            .await
            .insert(customer.tenant_id.clone(), customer.clone());
        Ok(())
    }

    async fn record_topup_attempt(
        &self,
        tenant_id: &str,
        success: bool,
        disable: bool,
        now: TimestampMs,
    ) -> Result<()> {
        let mut customers = self.customers.lock().await;
        if let Some(c) = customers.get_mut(tenant_id) {
            if success {
                c.topup_failures = 0;
            } else {
                c.topup_failures += 1;
                if disable {
                    c.topup_enabled = false;
                }
            }
            c.updated_at = now;
        }
        Ok(())
    }
}
