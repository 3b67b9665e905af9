//! Per-node command channel
//!
//! Each live node connection is an outbound frame queue plus a pending-map
//! of correlation id to waiter. `send_command` transmits a frame and awaits
//! the matching result with a deadline; closing the channel fails every
//! outstanding waiter. Per-channel ordering comes from the single writer
//! task draining the queue; cross-channel ordering is not guaranteed.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{CommandFrame, NodeCommand};
use crate::types::{HelmsmanError, Result};

/// Result frame delivered to a waiter
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub command: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

/// Live connection state for one node
pub struct NodeChannel {
    node_id: String,
    outbound: mpsc::Sender<Message>,
    pending: DashMap<String, oneshot::Sender<CommandReply>>,
    /// One orphan sweep per connection instance; a reconnect gets a fresh
    /// channel and therefore a fresh guard
    orphan_sweep_started: AtomicBool,
    closed: AtomicBool,
    deadline: Duration,
}

impl NodeChannel {
    pub fn new(node_id: String, outbound: mpsc::Sender<Message>, deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            outbound,
            pending: DashMap::new(),
            orphan_sweep_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            deadline,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim the one orphan sweep this connection is allowed to trigger.
    /// Returns true exactly once per channel instance.
    pub fn claim_orphan_sweep(&self) -> bool {
        !self.orphan_sweep_started.swap(true, Ordering::SeqCst)
    }

    /// Send a command and await its result frame.
    ///
    /// On success returns the result `data` payload (`null` when the agent
    /// sent none). Node-reported failures surface the agent's error payload;
    /// deadline expiry errors `timeout`; a closed channel fails fast.
    pub async fn send_command(&self, command: NodeCommand) -> Result<Value> {
        if self.is_closed() {
            return Err(HelmsmanError::ChannelClosed(format!(
                "node {} disconnected",
                self.node_id
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let name = command.name();
        let frame = CommandFrame {
            id: id.clone(),
            command,
        };
        let text = serde_json::to_string(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if self.outbound.send(Message::Text(text)).await.is_err() {
            self.pending.remove(&id);
            return Err(HelmsmanError::ChannelClosed(format!(
                "node {} send queue closed",
                self.node_id
            )));
        }
        debug!(node_id = %self.node_id, command = name, correlation = %id, "Command sent");

        match tokio::time::timeout(self.deadline, rx).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(HelmsmanError::Timeout(format!(
                    "{} to node {} after {}ms",
                    name,
                    self.node_id,
                    self.deadline.as_millis()
                )))
            }
            Ok(Err(_)) => Err(HelmsmanError::ChannelClosed(format!(
                "node {} disconnected while {} was pending",
                self.node_id, name
            ))),
            Ok(Ok(reply)) => {
                if reply.success {
                    Ok(reply.data.unwrap_or(Value::Null))
                } else {
                    Err(HelmsmanError::CommandFailed(format!(
                        "{} on node {}: {}",
                        name,
                        self.node_id,
                        reply.error.as_deref().unwrap_or("unspecified error")
                    )))
                }
            }
        }
    }

    /// Deliver a result frame to its waiter. Returns false for unknown or
    /// already-timed-out correlation ids.
    pub(crate) fn resolve(&self, id: &str, reply: CommandReply) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                warn!(
                    node_id = %self.node_id,
                    correlation = id,
                    "Result frame with no pending waiter"
                );
                false
            }
        }
    }

    /// Mark the channel closed and fail all pending waiters
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            // Dropping the sender wakes the waiter with a closed-channel error
            self.pending.remove(&id);
        }
    }

    /// Number of commands awaiting results
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(deadline_ms: u64) -> (Arc<NodeChannel>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (
            NodeChannel::new("n1".to_string(), tx, Duration::from_millis(deadline_ms)),
            rx,
        )
    }

    fn extract_correlation(msg: &Message) -> String {
        match msg {
            Message::Text(text) => {
                let v: Value = serde_json::from_str(text).unwrap();
                v["id"].as_str().unwrap().to_string()
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_resolution() {
        let (chan, mut out) = channel(1_000);
        let chan2 = chan.clone();
        let task = tokio::spawn(async move {
            chan2
                .send_command(NodeCommand::BotStop {
                    name: "bot-a".to_string(),
                })
                .await
        });

        let sent = out.recv().await.unwrap();
        let id = extract_correlation(&sent);
        assert!(chan.resolve(
            &id,
            CommandReply {
                command: "bot.stop".to_string(),
                success: true,
                data: Some(serde_json::json!({"stopped": true})),
                error: None,
            }
        ));

        let value = task.await.unwrap().unwrap();
        assert_eq!(value["stopped"], true);
        assert_eq!(chan.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_node_error_propagates() {
        let (chan, mut out) = channel(1_000);
        let chan2 = chan.clone();
        let task = tokio::spawn(async move {
            chan2
                .send_command(NodeCommand::BotInspect {
                    name: "bot-a".to_string(),
                })
                .await
        });

        let id = extract_correlation(&out.recv().await.unwrap());
        chan.resolve(
            &id,
            CommandReply {
                command: "bot.inspect".to_string(),
                success: false,
                data: None,
                error: Some("no such container".to_string()),
            },
        );

        let err = task.await.unwrap().unwrap_err();
        match err {
            HelmsmanError::CommandFailed(msg) => assert!(msg.contains("no such container")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_clears_waiter() {
        let (chan, _out) = channel(20);
        let err = chan
            .send_command(NodeCommand::BackupRunHot)
            .await
            .unwrap_err();
        assert!(matches!(err, HelmsmanError::Timeout(_)));
        assert_eq!(chan.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_waiters() {
        let (chan, mut out) = channel(5_000);
        let chan2 = chan.clone();
        let task = tokio::spawn(async move {
            chan2
                .send_command(NodeCommand::BotRestart {
                    name: "bot-a".to_string(),
                })
                .await
        });
        let _ = out.recv().await.unwrap();

        chan.close();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, HelmsmanError::ChannelClosed(_)));

        // New sends fail fast once closed
        let err = chan
            .send_command(NodeCommand::BackupRunHot)
            .await
            .unwrap_err();
        assert!(matches!(err, HelmsmanError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn test_orphan_sweep_guard_single_claim() {
        let (chan, _out) = channel(100);
        assert!(chan.claim_orphan_sweep());
        assert!(!chan.claim_orphan_sweep());
    }
}
