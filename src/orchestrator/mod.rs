//! Fleet orchestration
//!
//! ## Overview
//!
//! The orchestrator reacts to what the fabric observes:
//!
//! - `monitor` - heartbeat-overdue sweeps driving the status machine
//! - `recovery` - relocation of tenants off dead nodes, by tier priority
//! - `migration` - live relocation between healthy nodes, plus drains
//! - `orphan` - reconciliation when a dead node comes back
//!
//! ## Flow
//!
//! ```text
//! monitor --overdue--> recovery --commands--> fabric --> target nodes
//! fabric --ReturningHeartbeat event--> orphan cleaner --bot.stop--> node
//! ```

pub mod migration;
pub mod monitor;
pub mod orphan;
pub mod recovery;

pub use migration::{DrainReport, MigrationConfig, MigrationManager, MigrationResult};
pub use monitor::{LivenessMonitor, MonitorConfig};
pub use orphan::{OrphanCleaner, OrphanSweep};
pub use recovery::{RecoveryConfig, RecoveryManager, RecoverySummary};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::events::{EventBus, FleetEvent};

/// Subscribe the orphan cleaner to returning-node heartbeats.
///
/// The exactly-once guard lives on the connection; this task just executes
/// the sweeps the fabric has already claimed.
pub fn spawn_orphan_listener(cleaner: Arc<OrphanCleaner>, events: EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(FleetEvent::ReturningHeartbeat {
                    node_id,
                    containers,
                }) => match cleaner.sweep(&node_id, &containers).await {
                    Ok(sweep) => {
                        info!(
                            node_id = %node_id,
                            kept = sweep.kept.len(),
                            stopped = sweep.stopped.len(),
                            failed = sweep.failed.len(),
                            activated = sweep.activated,
                            "Orphan sweep finished"
                        );
                    }
                    Err(e) => {
                        error!(node_id = %node_id, error = %e, "Orphan sweep failed");
                    }
                },
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    error!(missed, "Orphan listener lagged; sweeps dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
