//! Constructor-injected service graph
//!
//! No module-level singletons: everything is built once, bottom-up, and
//! passed through this record. Tests build the same graph over the
//! in-memory repositories with a manual clock.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

use crate::billing::{
    spawn_ledger_listener, AutoTopup, BillingConfig, BotBilling, BulkConfig, BulkOperations,
    PaymentProcessor, TopupConfig,
};
use crate::config::Args;
use crate::db::Db;
use crate::events::{event_bus, EventBus};
use crate::fabric::{FabricConfig, NodeConnectionManager};
use crate::ledger::budget::BudgetChecker;
use crate::ledger::meter::{MeterIngest, MeterRepository, SqliteMeterRepository};
use crate::ledger::{CreditLedger, LedgerStore, SqliteLedgerStore};
use crate::notify::{LogNotifier, NotificationDispatcher, Notifier};
use crate::orchestrator::{
    spawn_orphan_listener, LivenessMonitor, MigrationConfig, MigrationManager, MonitorConfig,
    OrphanCleaner, RecoveryConfig, RecoveryManager,
};
use crate::registry::{
    BotInstanceRepository, NodeRepository, NotificationRepository, RecoveryLogRepository,
    SnapshotRepository, SqliteBotInstanceRepository, SqliteNodeRepository,
    SqliteNotificationRepository, SqliteRecoveryLogRepository, SqliteSnapshotRepository,
    SqliteTenantCustomerRepository, SqliteUndoGrantRepository, TenantCustomerRepository,
    UndoGrantRepository,
};
use crate::snapshots::{SnapshotConfig, SnapshotService};
use crate::storage::{FsObjectStore, HttpObjectStore, ObjectStore};
use crate::types::{Clock, Result, SystemClock};

/// Everything the coordinator is made of
pub struct Services {
    pub args: Args,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,

    // Repositories
    pub nodes: Arc<dyn NodeRepository>,
    pub bots: Arc<dyn BotInstanceRepository>,
    pub recovery_log: Arc<dyn RecoveryLogRepository>,
    pub snapshot_repo: Arc<dyn SnapshotRepository>,
    pub customers: Arc<dyn TenantCustomerRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub grants: Arc<dyn UndoGrantRepository>,
    pub meter: Arc<dyn MeterRepository>,

    // Money
    pub ledger: Arc<CreditLedger>,
    pub budget: Arc<BudgetChecker>,
    pub meter_ingest: Arc<MeterIngest>,

    // Fleet
    pub fabric: Arc<NodeConnectionManager>,
    pub recovery: Arc<RecoveryManager>,
    pub migration: Arc<MigrationManager>,
    pub orphan: Arc<OrphanCleaner>,
    pub monitor: Arc<LivenessMonitor>,

    // Billing
    pub billing: Arc<BotBilling>,
    pub topup: Option<Arc<AutoTopup>>,
    pub bulk: Arc<BulkOperations>,

    // Storage
    pub store: Arc<dyn ObjectStore>,
    pub snapshots: Arc<SnapshotService>,
    pub dispatcher: Arc<NotificationDispatcher>,
}

impl Services {
    /// Production graph over SQLite repositories
    pub fn build(args: Args, db: Db, processor: Option<Arc<dyn PaymentProcessor>>) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match args.storage_url.as_deref() {
            Some(url) => Arc::new(HttpObjectStore::new(url)?),
            None => Arc::new(FsObjectStore::new(args.storage_dir.clone())),
        };
        Self::assemble(
            args,
            Arc::new(SystemClock),
            Arc::new(SqliteNodeRepository::new(db.clone())),
            Arc::new(SqliteBotInstanceRepository::new(db.clone())),
            Arc::new(SqliteRecoveryLogRepository::new(db.clone())),
            Arc::new(SqliteSnapshotRepository::new(db.clone())),
            Arc::new(SqliteTenantCustomerRepository::new(db.clone())),
            Arc::new(SqliteNotificationRepository::new(db.clone())),
            Arc::new(SqliteUndoGrantRepository::new(db.clone())),
            Arc::new(SqliteLedgerStore::new(db.clone())),
            Arc::new(SqliteMeterRepository::new(db)),
            store,
            Arc::new(LogNotifier),
            processor,
        )
    }

    /// Assemble the graph from explicit parts (tests pass in-memory
    /// repositories and a manual clock)
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        args: Args,
        clock: Arc<dyn Clock>,
        nodes: Arc<dyn NodeRepository>,
        bots: Arc<dyn BotInstanceRepository>,
        recovery_log: Arc<dyn RecoveryLogRepository>,
        snapshot_repo: Arc<dyn SnapshotRepository>,
        customers: Arc<dyn TenantCustomerRepository>,
        notifications: Arc<dyn NotificationRepository>,
        grants: Arc<dyn UndoGrantRepository>,
        ledger_store: Arc<dyn LedgerStore>,
        meter: Arc<dyn MeterRepository>,
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
        processor: Option<Arc<dyn PaymentProcessor>>,
    ) -> Result<Self> {
        let events = event_bus();

        let ledger = Arc::new(CreditLedger::new(ledger_store, clock.clone()));
        let budget = Arc::new(BudgetChecker::new(
            meter.clone(),
            customers.clone(),
            clock.clone(),
            args.budget_cache_ttl_ms,
        ));
        let meter_ingest = Arc::new(MeterIngest::new(
            meter.clone(),
            ledger.clone(),
            budget.clone(),
        ));

        let fabric = NodeConnectionManager::new(
            nodes.clone(),
            bots.clone(),
            recovery_log.clone(),
            clock.clone(),
            events.clone(),
            FabricConfig {
                command_timeout: Duration::from_millis(args.command_timeout_ms),
                ..FabricConfig::default()
            },
        );

        let recovery = Arc::new(RecoveryManager::new(
            fabric.clone(),
            nodes.clone(),
            bots.clone(),
            recovery_log.clone(),
            clock.clone(),
            events.clone(),
            RecoveryConfig {
                default_estimate_mb: args.default_estimate_mb,
            },
        ));
        let migration = Arc::new(MigrationManager::new(
            fabric.clone(),
            nodes.clone(),
            bots.clone(),
            clock.clone(),
            events.clone(),
            MigrationConfig {
                default_estimate_mb: args.default_estimate_mb,
            },
        ));
        let orphan = Arc::new(OrphanCleaner::new(
            fabric.clone(),
            nodes.clone(),
            bots.clone(),
            clock.clone(),
        ));
        let monitor = Arc::new(LivenessMonitor::new(
            nodes.clone(),
            recovery.clone(),
            clock.clone(),
            MonitorConfig {
                soft_threshold_ms: args.heartbeat_soft_ms,
                hard_threshold_ms: args.heartbeat_hard_ms,
                interval: Duration::from_millis(args.monitor_interval_ms),
            },
        ));

        let billing = Arc::new(BotBilling::new(
            bots.clone(),
            fabric.clone(),
            ledger.clone(),
            notifications.clone(),
            clock.clone(),
            BillingConfig {
                grace_period_ms: args.grace_period_ms(),
                default_estimate_mb: args.default_estimate_mb,
            },
        ));
        let topup = processor.map(|processor| {
            Arc::new(AutoTopup::new(
                customers.clone(),
                ledger.clone(),
                notifications.clone(),
                processor,
                clock.clone(),
                TopupConfig {
                    max_failures: args.topup_max_failures,
                },
            ))
        });
        let bulk = Arc::new(BulkOperations::new(
            ledger.clone(),
            billing.clone(),
            bots.clone(),
            grants.clone(),
            clock.clone(),
            BulkConfig {
                max_ids: args.bulk_max_ids,
                undo_window_ms: args.undo_window_ms(),
            },
        ));

        let snapshots = Arc::new(SnapshotService::new(
            snapshot_repo.clone(),
            bots.clone(),
            fabric.clone(),
            store.clone(),
            clock.clone(),
            SnapshotConfig {
                retention_ms: args.snapshot_retention_ms(),
            },
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            notifications.clone(),
            notifier,
            clock.clone(),
        ));

        Ok(Self {
            args,
            clock,
            events,
            nodes,
            bots,
            recovery_log,
            snapshot_repo,
            customers,
            notifications,
            grants,
            meter,
            ledger,
            budget,
            meter_ingest,
            fabric,
            recovery,
            migration,
            orphan,
            monitor,
            billing,
            topup,
            bulk,
            store,
            snapshots,
            dispatcher,
        })
    }

    /// Spawn the background machinery: liveness sweeps, the orphan listener,
    /// billing's ledger listener, and the periodic sweepers.
    pub async fn start_background(&self) -> Result<Vec<JoinHandle<()>>> {
        self.fabric.load_routing().await?;

        let mut handles = vec![
            self.monitor.clone().spawn(),
            spawn_orphan_listener(self.orphan.clone(), self.events.clone()),
            spawn_ledger_listener(self.ledger.clone(), self.billing.clone(), self.topup.clone()),
            self.snapshots
                .clone()
                .spawn_retention(Duration::from_millis(self.args.retention_sweep_interval_ms)),
            self.snapshots
                .clone()
                .spawn_hot_backups(Duration::from_millis(self.args.hot_backup_interval_ms)),
            self.dispatcher
                .clone()
                .spawn(Duration::from_millis(self.args.notify_interval_ms)),
        ];

        // Grace-period destruction sweep
        {
            let billing = self.billing.clone();
            let interval = Duration::from_millis(self.args.destroy_sweep_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = billing.destroy_expired().await {
                        error!(error = %e, "Destruction sweep failed");
                    }
                }
            }));
        }

        // Meter roll-up sweep: raw events older than two buckets become
        // hourly summaries
        {
            let meter = self.meter.clone();
            let clock = self.clock.clone();
            let interval = Duration::from_millis(self.args.meter_aggregate_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let cutoff = clock.now_ms() - 2 * crate::ledger::meter::BUCKET_MS;
                    if let Err(e) = meter.aggregate_before(cutoff).await {
                        error!(error = %e, "Meter aggregation failed");
                    }
                }
            }));
        }

        Ok(handles)
    }
}
