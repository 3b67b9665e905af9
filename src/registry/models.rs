//! Fleet domain records: nodes, tenant workloads, recovery log, snapshots.
//!
//! Enum string forms match the persisted column values; parsing an unknown
//! value is a database-level error, never a panic.

use serde::{Deserialize, Serialize};

use crate::types::{HelmsmanError, Result, TimestampMs};

/// Container name prefix for tenant workloads
const CONTAINER_PREFIX: &str = "bot-";

// =============================================================================
// Nodes
// =============================================================================

/// Lifecycle status of a worker node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Unhealthy,
    Recovering,
    Returning,
    Offline,
    Draining,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unhealthy => "unhealthy",
            Self::Recovering => "recovering",
            Self::Returning => "returning",
            Self::Offline => "offline",
            Self::Draining => "draining",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "unhealthy" => Ok(Self::Unhealthy),
            "recovering" => Ok(Self::Recovering),
            "returning" => Ok(Self::Returning),
            "offline" => Ok(Self::Offline),
            "draining" => Ok(Self::Draining),
            "failed" => Ok(Self::Failed),
            other => Err(HelmsmanError::Database(format!(
                "unknown node status '{}'",
                other
            ))),
        }
    }

    /// Only fully healthy nodes receive new placements
    pub fn is_placement_candidate(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Statuses a workload assignment may legitimately reference
    pub fn can_host(&self) -> bool {
        matches!(self, Self::Active | Self::Returning | Self::Draining)
    }
}

/// Worker node record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub capacity_mb: u64,
    pub used_mb: u64,
    pub status: NodeStatus,
    pub last_heartbeat_at: Option<TimestampMs>,
    pub agent_version: String,
    /// SHA-256 fingerprint of the per-node channel secret
    #[serde(skip_serializing)]
    pub secret_hash: Option<String>,
    pub registered_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl Node {
    /// Memory headroom available for placement
    pub fn free_mb(&self) -> u64 {
        self.capacity_mb.saturating_sub(self.used_mb)
    }
}

// =============================================================================
// Bot instances
// =============================================================================

/// Billing state of a tenant workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    Active,
    Suspended,
    Destroyed,
}

impl BillingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(HelmsmanError::Database(format!(
                "unknown billing state '{}'",
                other
            ))),
        }
    }
}

/// Payment tier; drives recovery ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl ResourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(HelmsmanError::Database(format!(
                "unknown resource tier '{}'",
                other
            ))),
        }
    }

    /// Recovery processes lower ranks first (enterprise ahead of free)
    pub fn recovery_rank(&self) -> u8 {
        match self {
            Self::Enterprise => 0,
            Self::Pro => 1,
            Self::Starter => 2,
            Self::Free => 3,
        }
    }
}

/// Tenant workload record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotInstance {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub node_id: Option<String>,
    pub image: String,
    /// Environment variables handed to the container, stored as JSON
    pub env: std::collections::BTreeMap<String, String>,
    pub billing_state: BillingState,
    pub suspended_at: Option<TimestampMs>,
    pub destroy_after: Option<TimestampMs>,
    pub resource_tier: ResourceTier,
    pub storage_tier: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl BotInstance {
    /// Name of the container running this workload on its node
    pub fn container_name(&self) -> String {
        format!("{}{}", CONTAINER_PREFIX, self.id)
    }
}

/// Decode a reported container name back to a workload id
pub fn bot_id_from_container(container: &str) -> Option<&str> {
    container.strip_prefix(CONTAINER_PREFIX).filter(|s| !s.is_empty())
}

// =============================================================================
// Recovery log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    HeartbeatTimeout,
    Manual,
}

impl RecoveryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "heartbeat_timeout" => Ok(Self::HeartbeatTimeout),
            "manual" => Ok(Self::Manual),
            other => Err(HelmsmanError::Database(format!(
                "unknown recovery trigger '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    InProgress,
    Completed,
    Partial,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            other => Err(HelmsmanError::Database(format!(
                "unknown recovery status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryItemStatus {
    Recovered,
    Failed,
    Waiting,
    /// Recovered on a later `retry_waiting` pass
    Retried,
}

impl RecoveryItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovered => "recovered",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
            Self::Retried => "retried",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "recovered" => Ok(Self::Recovered),
            "failed" => Ok(Self::Failed),
            "waiting" => Ok(Self::Waiting),
            "retried" => Ok(Self::Retried),
            other => Err(HelmsmanError::Database(format!(
                "unknown recovery item status '{}'",
                other
            ))),
        }
    }
}

/// One node-failure recovery run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub id: String,
    pub node_id: String,
    pub trigger: RecoveryTrigger,
    pub status: RecoveryStatus,
    pub total: u32,
    pub recovered: u32,
    pub failed: u32,
    pub waiting: u32,
    pub started_at: TimestampMs,
    pub completed_at: Option<TimestampMs>,
    /// Serialized summary report
    pub report: Option<String>,
}

/// Per-tenant relocation record inside a recovery event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryItem {
    pub id: String,
    pub recovery_event_id: String,
    pub tenant_id: String,
    pub bot_id: String,
    pub source_node: String,
    pub target_node: Option<String>,
    pub backup_key: String,
    pub status: RecoveryItemStatus,
    pub reason: Option<String>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    Nightly,
    OnDemand,
    PreRestore,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nightly => "nightly",
            Self::OnDemand => "on-demand",
            Self::PreRestore => "pre-restore",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "nightly" => Ok(Self::Nightly),
            "on-demand" => Ok(Self::OnDemand),
            "pre-restore" => Ok(Self::PreRestore),
            other => Err(HelmsmanError::Database(format!(
                "unknown snapshot kind '{}'",
                other
            ))),
        }
    }
}

/// Stored backup archive, soft-deleted before hard deletion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub kind: SnapshotKind,
    pub storage_path: String,
    pub remote_key: Option<String>,
    pub size_bytes: u64,
    pub created_at: TimestampMs,
    pub expires_at: Option<TimestampMs>,
    pub deleted_at: Option<TimestampMs>,
}

// =============================================================================
// Bulk grant undo
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoStatus {
    NotUndone,
    Undone,
    /// Some compensating corrections failed; the failures are recorded and
    /// the operation is not re-undoable
    Partial,
}

impl UndoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotUndone => "not_undone",
            Self::Undone => "undone",
            Self::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "not_undone" => Ok(Self::NotUndone),
            "undone" => Ok(Self::Undone),
            "partial" => Ok(Self::Partial),
            other => Err(HelmsmanError::Database(format!(
                "unknown undo status '{}'",
                other
            ))),
        }
    }
}

/// Reversible bulk credit grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoableGrant {
    pub operation_id: String,
    /// Tenants whose grant succeeded
    pub tenant_ids: Vec<String>,
    pub amount_cents: i64,
    pub deadline: TimestampMs,
    pub undo_status: UndoStatus,
    pub failed_ids: Vec<String>,
    pub created_at: TimestampMs,
}

// =============================================================================
// Notifications & tenant customers
// =============================================================================

/// Queued outbound notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub tenant_id: String,
    pub kind: String,
    pub body: String,
    pub created_at: TimestampMs,
    pub sent_at: Option<TimestampMs>,
}

/// Payment-processor linkage and admission caps for a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantCustomer {
    pub tenant_id: String,
    pub processor_customer_id: Option<String>,
    pub topup_enabled: bool,
    pub topup_threshold_cents: Option<i64>,
    pub topup_amount_cents: Option<i64>,
    pub topup_failures: u32,
    pub hourly_cap_cents: Option<i64>,
    pub monthly_cap_cents: Option<i64>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            NodeStatus::Active,
            NodeStatus::Unhealthy,
            NodeStatus::Recovering,
            NodeStatus::Returning,
            NodeStatus::Offline,
            NodeStatus::Draining,
            NodeStatus::Failed,
        ] {
            assert_eq!(NodeStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(NodeStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_placement_candidacy() {
        assert!(NodeStatus::Active.is_placement_candidate());
        for s in [
            NodeStatus::Returning,
            NodeStatus::Draining,
            NodeStatus::Recovering,
            NodeStatus::Offline,
            NodeStatus::Unhealthy,
            NodeStatus::Failed,
        ] {
            assert!(!s.is_placement_candidate());
        }
    }

    #[test]
    fn test_tier_recovery_rank() {
        assert!(ResourceTier::Enterprise.recovery_rank() < ResourceTier::Pro.recovery_rank());
        assert!(ResourceTier::Pro.recovery_rank() < ResourceTier::Starter.recovery_rank());
        assert!(ResourceTier::Starter.recovery_rank() < ResourceTier::Free.recovery_rank());
    }

    #[test]
    fn test_container_name_decode() {
        assert_eq!(bot_id_from_container("bot-abc123"), Some("abc123"));
        assert_eq!(bot_id_from_container("bot-"), None);
        assert_eq!(bot_id_from_container("sidecar-xyz"), None);
    }
}
