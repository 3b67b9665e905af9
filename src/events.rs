//! Coordinator-internal event bus
//!
//! Decouples the channel fabric from the orchestrator: the fabric publishes
//! what it observed, sweepers and managers subscribe. The bus is a lossy
//! broadcast; durable facts live in the repositories, not here.

use tokio::sync::broadcast;

use crate::fabric::protocol::ContainerReport;

/// Fleet-level happenings
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// First heartbeat of a returning node's connection; triggers orphan
    /// cleanup exactly once per connection
    ReturningHeartbeat {
        node_id: String,
        containers: Vec<ContainerReport>,
    },
    /// A placement could not be satisfied; operators may add capacity and
    /// retry waiting recovery items
    CapacityOverflow { needed_mb: u64, context: String },
}

pub type EventBus = broadcast::Sender<FleetEvent>;

/// Build the shared bus
pub fn event_bus() -> EventBus {
    let (tx, _) = broadcast::channel(256);
    tx
}
