//! Configuration for Helmsman
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// Helmsman - fleet control plane for tenant container hosting
#[derive(Parser, Debug, Clone)]
#[command(name = "helmsman")]
#[command(about = "Coordinator for tenant container hosting fleets")]
pub struct Args {
    /// Unique identifier for this coordinator instance
    #[arg(long, env = "INSTANCE_ID", default_value_t = Uuid::new_v4())]
    pub instance_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:7070")]
    pub listen: SocketAddr,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "helmsman.db")]
    pub database_path: PathBuf,

    /// Shared one-time registration token accepted from first-run node agents
    #[arg(long, env = "REGISTRATION_TOKEN")]
    pub registration_token: Option<String>,

    /// Enable development mode (registration token optional)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Outbound command deadline in milliseconds
    #[arg(long, env = "COMMAND_TIMEOUT_MS", default_value = "30000")]
    pub command_timeout_ms: u64,

    /// Heartbeat-overdue soft threshold in milliseconds (active -> unhealthy)
    #[arg(long, env = "HEARTBEAT_SOFT_MS", default_value = "30000")]
    pub heartbeat_soft_ms: i64,

    /// Heartbeat-overdue hard threshold in milliseconds (unhealthy -> recovering)
    #[arg(long, env = "HEARTBEAT_HARD_MS", default_value = "90000")]
    pub heartbeat_hard_ms: i64,

    /// Liveness monitor tick interval in milliseconds
    #[arg(long, env = "MONITOR_INTERVAL_MS", default_value = "10000")]
    pub monitor_interval_ms: u64,

    /// Conservative per-tenant memory estimate in MB when usage is unknown
    #[arg(long, env = "DEFAULT_ESTIMATE_MB", default_value = "100")]
    pub default_estimate_mb: u64,

    /// Days between suspension and destruction of a workload
    #[arg(long, env = "GRACE_DAYS", default_value = "30")]
    pub grace_days: i64,

    /// Minutes during which a bulk grant can be undone
    #[arg(long, env = "UNDO_WINDOW_MINUTES", default_value = "5")]
    pub undo_window_minutes: i64,

    /// Maximum tenant ids accepted by one bulk operation
    #[arg(long, env = "BULK_MAX_IDS", default_value = "500")]
    pub bulk_max_ids: usize,

    /// Consecutive auto-topup charge failures before the feature is disabled
    #[arg(long, env = "TOPUP_MAX_FAILURES", default_value = "3")]
    pub topup_max_failures: u32,

    /// Rolling-spend cache TTL in milliseconds
    #[arg(long, env = "BUDGET_CACHE_TTL_MS", default_value = "1000")]
    pub budget_cache_ttl_ms: i64,

    /// Days a soft-deleted snapshot is kept before hard deletion
    #[arg(long, env = "SNAPSHOT_RETENTION_DAYS", default_value = "7")]
    pub snapshot_retention_days: i64,

    /// Grace-period destruction sweep interval in milliseconds
    #[arg(long, env = "DESTROY_SWEEP_INTERVAL_MS", default_value = "3600000")]
    pub destroy_sweep_interval_ms: u64,

    /// Snapshot retention sweep interval in milliseconds
    #[arg(long, env = "RETENTION_SWEEP_INTERVAL_MS", default_value = "3600000")]
    pub retention_sweep_interval_ms: u64,

    /// Hot-backup trigger interval in milliseconds
    #[arg(long, env = "HOT_BACKUP_INTERVAL_MS", default_value = "900000")]
    pub hot_backup_interval_ms: u64,

    /// Notification delivery sweep interval in milliseconds
    #[arg(long, env = "NOTIFY_INTERVAL_MS", default_value = "60000")]
    pub notify_interval_ms: u64,

    /// Meter aggregation sweep interval in milliseconds
    #[arg(long, env = "METER_AGGREGATE_INTERVAL_MS", default_value = "300000")]
    pub meter_aggregate_interval_ms: u64,

    /// Base URL of the HTTP object store; unset selects the local filesystem store
    #[arg(long, env = "STORAGE_URL")]
    pub storage_url: Option<String>,

    /// Directory for the local filesystem object store
    #[arg(long, env = "STORAGE_DIR", default_value = "helmsman-store")]
    pub storage_dir: PathBuf,

    /// High-entropy secret enabling archive encryption when set
    #[arg(long, env = "ARCHIVE_SECRET")]
    pub archive_secret: Option<String>,
}

impl Args {
    /// Validate configuration at startup
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.registration_token.is_none() {
            return Err("REGISTRATION_TOKEN is required outside dev mode".to_string());
        }
        if self.heartbeat_hard_ms <= self.heartbeat_soft_ms {
            return Err(format!(
                "HEARTBEAT_HARD_MS ({}) must exceed HEARTBEAT_SOFT_MS ({})",
                self.heartbeat_hard_ms, self.heartbeat_soft_ms
            ));
        }
        if self.bulk_max_ids == 0 {
            return Err("BULK_MAX_IDS must be positive".to_string());
        }
        if let Some(ref secret) = self.archive_secret {
            if secret.len() < 32 {
                return Err("ARCHIVE_SECRET must be at least 32 characters".to_string());
            }
        }
        Ok(())
    }

    /// Grace period in milliseconds
    pub fn grace_period_ms(&self) -> i64 {
        self.grace_days * 24 * 60 * 60 * 1000
    }

    /// Undo window in milliseconds
    pub fn undo_window_ms(&self) -> i64 {
        self.undo_window_minutes * 60 * 1000
    }

    /// Snapshot retention in milliseconds
    pub fn snapshot_retention_ms(&self) -> i64 {
        self.snapshot_retention_days * 24 * 60 * 60 * 1000
    }
}
