//! Heartbeat-overdue liveness monitor
//!
//! Two thresholds drive the node status machine: past the soft threshold an
//! `active` node turns `unhealthy`; past the hard threshold an `unhealthy`
//! node is handed to the recovery manager. Nodes that are `returning`,
//! `draining`, or already being recovered are left alone.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::recovery::RecoveryManager;
use crate::registry::{NodeRepository, NodeStatus, RecoveryTrigger};
use crate::types::{Clock, Result};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// active -> unhealthy after this much heartbeat silence
    pub soft_threshold_ms: i64,
    /// unhealthy -> recovering after this much heartbeat silence
    pub hard_threshold_ms: i64,
    /// Sweep interval
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            soft_threshold_ms: 30_000,
            hard_threshold_ms: 90_000,
            interval: Duration::from_secs(10),
        }
    }
}

pub struct LivenessMonitor {
    nodes: Arc<dyn NodeRepository>,
    recovery: Arc<RecoveryManager>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
}

impl LivenessMonitor {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        recovery: Arc<RecoveryManager>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            nodes,
            recovery,
            clock,
            config,
        }
    }

    /// One sweep over the fleet
    pub async fn tick(&self) -> Result<()> {
        let now = self.clock.now_ms();

        for node in self.nodes.list().await? {
            // A node that registered but never heartbeated counts from its
            // registration time
            let last_seen = node.last_heartbeat_at.unwrap_or(node.registered_at);
            let silence = now - last_seen;

            match node.status {
                NodeStatus::Active if silence > self.config.soft_threshold_ms => {
                    if self
                        .nodes
                        .transition(&node.id, NodeStatus::Active, NodeStatus::Unhealthy, now)
                        .await?
                    {
                        warn!(
                            node_id = %node.id,
                            silence_ms = silence,
                            "Heartbeat overdue; node unhealthy"
                        );
                    }
                }
                NodeStatus::Unhealthy if silence > self.config.hard_threshold_ms => {
                    info!(
                        node_id = %node.id,
                        silence_ms = silence,
                        "Heartbeat long overdue; starting recovery"
                    );
                    if let Err(e) = self
                        .recovery
                        .recover_node(&node.id, RecoveryTrigger::HeartbeatTimeout)
                        .await
                    {
                        error!(node_id = %node.id, error = %e, "Recovery trigger failed");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Run the sweep loop until the task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    error!(error = %e, "Liveness sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus;
    use crate::fabric::{FabricConfig, NodeConnectionManager};
    use crate::orchestrator::recovery::RecoveryConfig;
    use crate::registry::{
        MemoryBotInstanceRepository, MemoryNodeRepository, MemoryRecoveryLogRepository,
        NodeRegistration,
    };
    use crate::types::ManualClock;

    async fn setup() -> (LivenessMonitor, Arc<MemoryNodeRepository>, Arc<ManualClock>) {
        let nodes = Arc::new(MemoryNodeRepository::new());
        let bots = Arc::new(MemoryBotInstanceRepository::new());
        let recovery_log = Arc::new(MemoryRecoveryLogRepository::new());
        let clock = ManualClock::new(0);
        let events = event_bus();
        let fabric = NodeConnectionManager::new(
            nodes.clone(),
            bots.clone(),
            recovery_log.clone(),
            clock.clone(),
            events.clone(),
            FabricConfig::default(),
        );
        let recovery = Arc::new(RecoveryManager::new(
            fabric,
            nodes.clone(),
            bots,
            recovery_log,
            clock.clone(),
            events,
            RecoveryConfig::default(),
        ));
        let monitor = LivenessMonitor::new(
            nodes.clone(),
            recovery,
            clock.clone(),
            MonitorConfig::default(),
        );
        nodes
            .upsert_registration(
                &NodeRegistration {
                    node_id: "n1".to_string(),
                    host: "10.0.0.1".to_string(),
                    capacity_mb: 4096,
                    agent_version: "1.0.0".to_string(),
                },
                0,
            )
            .await
            .unwrap();
        (monitor, nodes, clock)
    }

    #[tokio::test]
    async fn test_soft_then_hard_threshold() {
        let (monitor, nodes, clock) = setup().await;
        nodes.update_heartbeat("n1", 100, 0).await.unwrap();

        // Inside the soft window: stays active
        clock.set(29_000);
        monitor.tick().await.unwrap();
        assert_eq!(
            nodes.get("n1").await.unwrap().unwrap().status,
            NodeStatus::Active
        );

        // Past soft: unhealthy
        clock.set(31_000);
        monitor.tick().await.unwrap();
        assert_eq!(
            nodes.get("n1").await.unwrap().unwrap().status,
            NodeStatus::Unhealthy
        );

        // Past hard: recovery runs and parks the node offline (no tenants)
        clock.set(91_000);
        monitor.tick().await.unwrap();
        assert_eq!(
            nodes.get("n1").await.unwrap().unwrap().status,
            NodeStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_holds_status() {
        let (monitor, nodes, clock) = setup().await;
        nodes.update_heartbeat("n1", 100, 25_000).await.unwrap();
        clock.set(31_000);
        monitor.tick().await.unwrap();
        assert_eq!(
            nodes.get("n1").await.unwrap().unwrap().status,
            NodeStatus::Active
        );
    }
}
