//! Node connection manager
//!
//! Owns the live fabric between coordinator and nodes: the channel set,
//! tenant-to-node routing, and node status transitions driven by
//! registration. Each channel gets a writer task draining its outbound queue
//! and a single reader task, so per-channel message order is preserved while
//! channels run concurrently.

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::channel::{CommandReply, NodeChannel};
use super::heartbeat::HeartbeatProcessor;
use super::protocol::{AgentFrame, NodeCommand};
use crate::events::EventBus;
use crate::placement;
use crate::registry::{
    BotInstanceRepository, Node, NodeRegistration, NodeRepository, RecoveryLogRepository,
};
use crate::types::{Clock, HelmsmanError, Result};

/// Fabric tuning
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Deadline applied to every outbound command
    pub command_timeout: Duration,
    /// Outbound frame queue depth per channel
    pub outbound_buffer: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            outbound_buffer: 64,
        }
    }
}

pub struct NodeConnectionManager {
    nodes: Arc<dyn NodeRepository>,
    bots: Arc<dyn BotInstanceRepository>,
    recovery_log: Arc<dyn RecoveryLogRepository>,
    heartbeats: HeartbeatProcessor,
    clock: Arc<dyn Clock>,
    config: FabricConfig,
    /// Live channels by node id
    channels: DashMap<String, Arc<NodeChannel>>,
    /// In-memory routing: bot id to hosting node id
    routing: DashMap<String, String>,
}

impl NodeConnectionManager {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        bots: Arc<dyn BotInstanceRepository>,
        recovery_log: Arc<dyn RecoveryLogRepository>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: FabricConfig,
    ) -> Arc<Self> {
        let heartbeats = HeartbeatProcessor::new(nodes.clone(), clock.clone(), events);
        Arc::new(Self {
            nodes,
            bots,
            recovery_log,
            heartbeats,
            clock,
            config,
            channels: DashMap::new(),
            routing: DashMap::new(),
        })
    }

    /// Populate routing from persisted assignments (startup)
    pub async fn load_routing(&self) -> Result<usize> {
        let bots = self.bots.list().await?;
        let mut loaded = 0;
        for bot in bots {
            if let Some(node_id) = bot.node_id {
                self.routing.insert(bot.id, node_id);
                loaded += 1;
            }
        }
        info!("Loaded {} workload routes", loaded);
        Ok(loaded)
    }

    /// Register a node (first run or reconnect).
    ///
    /// Creates the record if absent, otherwise refreshes host, capacity and
    /// agent version. Status rules are applied atomically in the repository:
    /// fresh nodes come up `active`, dead nodes come back `returning`,
    /// `unhealthy` nodes are revived, everything else keeps its status. Any
    /// in-flight recovery event for the node is closed; tenants already
    /// relocated keep their new homes and the orphan cleaner deals with
    /// leftovers.
    pub async fn register_node(&self, reg: &NodeRegistration) -> Result<Node> {
        let now = self.clock.now_ms();
        let node = self.nodes.upsert_registration(reg, now).await?;

        let closed = self
            .recovery_log
            .close_open_for_node(&reg.node_id, now)
            .await?;
        if closed > 0 {
            info!(
                node_id = %reg.node_id,
                closed,
                "Node re-registered mid-recovery; closed in-flight recovery event(s)"
            );
        }

        info!(
            node_id = %reg.node_id,
            host = %reg.host,
            capacity_mb = reg.capacity_mb,
            status = node.status.as_str(),
            "Node registered"
        );
        Ok(node)
    }

    /// Bind a WebSocket to a node id and start its reader/writer tasks.
    /// An existing channel for the node is closed first.
    pub fn attach<S>(self: Arc<Self>, node_id: &str, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(self.config.outbound_buffer);
        let channel = NodeChannel::new(
            node_id.to_string(),
            out_tx,
            self.config.command_timeout,
        );

        if let Some(old) = self
            .channels
            .insert(node_id.to_string(), channel.clone())
        {
            warn!(node_id, "Replacing existing channel");
            old.close();
        }
        info!(node_id, "Channel attached");

        tokio::spawn(write_loop(node_id.to_string(), sink, out_rx));

        let manager = Arc::clone(&self);
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            manager.read_loop(&node_id, channel, stream).await;
        });
    }

    async fn read_loop<S>(
        &self,
        node_id: &str,
        channel: Arc<NodeChannel>,
        mut stream: SplitStream<WebSocketStream<S>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_frame(&channel, &text).await,
                Ok(Message::Close(_)) => {
                    debug!(node_id, "Close frame received");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(node_id, error = %e, "Channel read error");
                    break;
                }
            }
        }

        channel.close();
        // Only remove the mapping if a reconnect has not already replaced it
        self.channels
            .remove_if(node_id, |_, current| Arc::ptr_eq(current, &channel));
        info!(node_id, "Channel detached");
    }

    async fn handle_frame(&self, channel: &Arc<NodeChannel>, text: &str) {
        match serde_json::from_str::<AgentFrame>(text) {
            Ok(AgentFrame::Heartbeat { containers }) => {
                if let Err(e) = self.heartbeats.process(channel, &containers).await {
                    error!(node_id = %channel.node_id(), error = %e, "Heartbeat processing failed");
                }
            }
            Ok(AgentFrame::CommandResult {
                id,
                command,
                success,
                data,
                error,
            }) => {
                channel.resolve(
                    &id,
                    CommandReply {
                        command,
                        success,
                        data,
                        error,
                    },
                );
            }
            Ok(AgentFrame::HealthEvent {
                container,
                event,
                detail,
            }) => {
                debug!(
                    node_id = %channel.node_id(),
                    container = %container,
                    event = %event,
                    detail = ?detail,
                    "Container health event"
                );
            }
            Err(e) => {
                warn!(node_id = %channel.node_id(), error = %e, "Unparseable frame dropped");
            }
        }
    }

    /// The live channel for a node, if connected
    pub fn channel(&self, node_id: &str) -> Option<Arc<NodeChannel>> {
        self.channels.get(node_id).map(|c| c.clone())
    }

    /// Node ids with a live channel
    pub fn connected_nodes(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Send a command to a node and await its result
    pub async fn send_command(&self, node_id: &str, command: NodeCommand) -> Result<Value> {
        let channel = self.channel(node_id).ok_or_else(|| {
            HelmsmanError::ChannelClosed(format!("no live channel to node {}", node_id))
        })?;
        channel.send_command(command).await
    }

    /// Move a workload's assignment to a new node, updating both the durable
    /// record and the in-memory routing
    pub async fn reassign_tenant(&self, bot_id: &str, new_node_id: &str) -> Result<()> {
        self.bots
            .assign_node(bot_id, Some(new_node_id), self.clock.now_ms())
            .await?;
        self.routing
            .insert(bot_id.to_string(), new_node_id.to_string());
        debug!(bot_id, node_id = new_node_id, "Workload reassigned");
        Ok(())
    }

    /// Clear a workload's assignment (destruction)
    pub async fn unassign_tenant(&self, bot_id: &str) -> Result<()> {
        self.bots.assign_node(bot_id, None, self.clock.now_ms()).await?;
        self.routing.remove(bot_id);
        Ok(())
    }

    /// Node currently routing a workload
    pub fn node_for(&self, bot_id: &str) -> Option<String> {
        self.routing.get(bot_id).map(|n| n.clone())
    }

    /// Workload ids routed to a node
    pub fn tenants_on(&self, node_id: &str) -> Vec<String> {
        self.routing
            .iter()
            .filter(|e| e.value() == node_id)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Capacity accounting passthrough
    pub async fn adjust_used(&self, node_id: &str, delta_mb: i64) -> Result<()> {
        self.nodes
            .adjust_used(node_id, delta_mb, self.clock.now_ms())
            .await
    }

    /// Best placement target, excluding a node (delegates to the placement
    /// engine over the current fleet)
    pub async fn find_best_target(
        &self,
        exclude_node_id: Option<&str>,
        estimated_mb: u64,
    ) -> Result<Option<Node>> {
        let nodes = self.nodes.list().await?;
        let exclude: Vec<&str> = exclude_node_id.into_iter().collect();
        Ok(placement::find_placement_excluding(&nodes, estimated_mb, &exclude).cloned())
    }
}

/// Drain the outbound queue into the socket; exits when the queue closes
async fn write_loop<S>(
    node_id: String,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = out_rx.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(node_id = %node_id, error = %e, "Channel write error");
            break;
        }
    }
    let _ = sink.close().await;
}
