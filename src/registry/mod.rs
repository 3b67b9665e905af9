//! Durable fleet state: models and one repository per entity.
//!
//! Every repository is a trait with a SQLite implementation for deployments
//! and an in-memory implementation honoring the same contract for tests.

pub mod bots;
pub mod customers;
pub mod grants;
pub mod models;
pub mod nodes;
pub mod notifications;
pub mod recovery_log;
pub mod snapshots;

pub use bots::{BotInstanceRepository, MemoryBotInstanceRepository, SqliteBotInstanceRepository};
pub use customers::{
    MemoryTenantCustomerRepository, SqliteTenantCustomerRepository, TenantCustomerRepository,
};
pub use grants::{MemoryUndoGrantRepository, SqliteUndoGrantRepository, UndoGrantRepository};
pub use models::{
    bot_id_from_container, BillingState, BotInstance, Node, NodeStatus, Notification,
    RecoveryEvent, RecoveryItem, RecoveryItemStatus, RecoveryStatus, RecoveryTrigger,
    ResourceTier, Snapshot, SnapshotKind, TenantCustomer, UndoStatus, UndoableGrant,
};
pub use nodes::{
    status_after_registration, MemoryNodeRepository, NodeRegistration, NodeRepository,
    SqliteNodeRepository,
};
pub use notifications::{
    MemoryNotificationRepository, NotificationRepository, SqliteNotificationRepository,
};
pub use recovery_log::{
    MemoryRecoveryLogRepository, RecoveryCounters, RecoveryLogRepository,
    SqliteRecoveryLogRepository,
};
pub use snapshots::{MemorySnapshotRepository, SnapshotRepository, SqliteSnapshotRepository};
