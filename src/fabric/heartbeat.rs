//! Heartbeat processing
//!
//! Heartbeats carry the node's running container inventory. Processing sums
//! reported memory into `used_mb` and bumps liveness. Status handling is
//! deliberately narrow: a fresh heartbeat revives an `unhealthy` node, but a
//! `returning` or `draining` node keeps its status. Those transitions belong
//! to the orphan cleaner and the drain path.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::channel::NodeChannel;
use super::protocol::ContainerReport;
use crate::events::{EventBus, FleetEvent};
use crate::registry::{NodeRepository, NodeStatus};
use crate::types::{Clock, Result};

pub struct HeartbeatProcessor {
    nodes: Arc<dyn NodeRepository>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl HeartbeatProcessor {
    pub fn new(nodes: Arc<dyn NodeRepository>, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            nodes,
            clock,
            events,
        }
    }

    /// Apply one heartbeat from a node's live channel
    pub async fn process(
        &self,
        channel: &NodeChannel,
        containers: &[ContainerReport],
    ) -> Result<()> {
        let node_id = channel.node_id();
        let now = self.clock.now_ms();

        let Some(node) = self.nodes.get(node_id).await? else {
            warn!(node_id, "Heartbeat from unregistered node ignored");
            return Ok(());
        };

        match node.status {
            NodeStatus::Unhealthy => {
                if self
                    .nodes
                    .transition(node_id, NodeStatus::Unhealthy, NodeStatus::Active, now)
                    .await?
                {
                    info!(node_id, "Node revived by heartbeat");
                }
            }
            NodeStatus::Returning => {
                // The first heartbeat of this connection kicks off orphan
                // cleanup; later heartbeats (and retries on the same
                // connection) do not
                if channel.claim_orphan_sweep() {
                    let _ = self.events.send(FleetEvent::ReturningHeartbeat {
                        node_id: node_id.to_string(),
                        containers: containers.to_vec(),
                    });
                }
            }
            _ => {}
        }

        let used_mb: u64 = containers.iter().map(|c| c.memory_mb).sum();
        self.nodes.update_heartbeat(node_id, used_mb, now).await?;
        debug!(node_id, used_mb, containers = containers.len(), "Heartbeat applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus;
    use crate::registry::{MemoryNodeRepository, NodeRegistration};
    use crate::types::ManualClock;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn node_repo(status: NodeStatus) -> Arc<MemoryNodeRepository> {
        let repo = Arc::new(MemoryNodeRepository::new());
        repo.upsert_registration(
            &NodeRegistration {
                node_id: "n1".to_string(),
                host: "10.0.0.1".to_string(),
                capacity_mb: 4096,
                agent_version: "1.0.0".to_string(),
            },
            1_000,
        )
        .await
        .unwrap();
        repo.set_status("n1", status, 1_000).await.unwrap();
        repo
    }

    fn test_channel() -> Arc<NodeChannel> {
        let (tx, _rx) = mpsc::channel(4);
        NodeChannel::new("n1".to_string(), tx, Duration::from_secs(1))
    }

    fn report(name: &str, mb: u64) -> ContainerReport {
        ContainerReport {
            name: name.to_string(),
            memory_mb: mb,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_sums_memory_and_revives_unhealthy() {
        let repo = node_repo(NodeStatus::Unhealthy).await;
        let events = event_bus();
        let proc = HeartbeatProcessor::new(repo.clone(), ManualClock::new(5_000), events);

        proc.process(&test_channel(), &[report("bot-a", 100), report("bot-b", 150)])
            .await
            .unwrap();

        let node = repo.get("n1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.used_mb, 250);
        assert_eq!(node.last_heartbeat_at, Some(5_000));
    }

    #[tokio::test]
    async fn test_heartbeat_never_overrides_returning_or_draining() {
        for status in [NodeStatus::Returning, NodeStatus::Draining] {
            let repo = node_repo(status).await;
            let events = event_bus();
            let proc = HeartbeatProcessor::new(repo.clone(), ManualClock::new(5_000), events);

            proc.process(&test_channel(), &[report("bot-a", 100)])
                .await
                .unwrap();

            let node = repo.get("n1").await.unwrap().unwrap();
            assert_eq!(node.status, status);
            assert_eq!(node.last_heartbeat_at, Some(5_000));
        }
    }

    #[tokio::test]
    async fn test_returning_triggers_sweep_once_per_connection() {
        let repo = node_repo(NodeStatus::Returning).await;
        let events = event_bus();
        let mut rx = events.subscribe();
        let proc = HeartbeatProcessor::new(repo.clone(), ManualClock::new(5_000), events);

        let chan = test_channel();
        proc.process(&chan, &[report("bot-a", 100)]).await.unwrap();
        proc.process(&chan, &[report("bot-a", 100)]).await.unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            FleetEvent::ReturningHeartbeat { .. }
        ));
        assert!(rx.try_recv().is_err());

        // A fresh connection claims a fresh sweep
        let chan2 = test_channel();
        proc.process(&chan2, &[report("bot-a", 100)]).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            FleetEvent::ReturningHeartbeat { .. }
        ));
    }
}
