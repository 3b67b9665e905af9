//! Shared test harness: in-memory service graph, manual clock, and scripted
//! node agents speaking the real wire protocol over an in-process duplex.

#![allow(dead_code)]

use async_trait::async_trait;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use helmsman::billing::{ChargeReceipt, PaymentProcessor};
use helmsman::config::Args;
use helmsman::ledger::{MemoryLedgerStore, TransactionType};
use helmsman::notify::LogNotifier;
use helmsman::registry::{
    BillingState, BotInstance, MemoryBotInstanceRepository, MemoryNodeRepository,
    MemoryRecoveryLogRepository, MemorySnapshotRepository, MemoryTenantCustomerRepository,
    MemoryUndoGrantRepository, MemoryNotificationRepository, NodeRegistration, ResourceTier,
};
use helmsman::ledger::meter::MemoryMeterRepository;
use helmsman::services::Services;
use helmsman::storage::ObjectStore;
use helmsman::types::{Clock, HelmsmanError, ManualClock, Result};

/// In-memory object store for tests
#[derive(Default)]
pub struct MemObjectStore {
    objects: StdMutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let data = tokio::fs::read(local).await.unwrap_or_default();
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| HelmsmanError::Storage(format!("missing object {}", key)))?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Mock payment processor with a switchable failure mode
#[derive(Default)]
pub struct MockProcessor {
    pub fail: AtomicBool,
    pub charges: StdMutex<Vec<(String, i64)>>,
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn charge(&self, customer_id: &str, amount_cents: i64) -> Result<ChargeReceipt> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HelmsmanError::Internal("card declined".to_string()));
        }
        let mut charges = self.charges.lock().unwrap();
        charges.push((customer_id.to_string(), amount_cents));
        Ok(ChargeReceipt {
            charge_id: format!("ch_{}", charges.len()),
        })
    }
}

/// The assembled world under test
pub struct TestWorld {
    pub services: Arc<Services>,
    pub clock: Arc<ManualClock>,
    pub processor: Arc<MockProcessor>,
}

pub async fn world() -> TestWorld {
    world_at(1_000_000).await
}

pub async fn world_at(start_ms: i64) -> TestWorld {
    let args = Args::parse_from(["helmsman", "--dev-mode"]);
    let clock = ManualClock::new(start_ms);
    let processor = Arc::new(MockProcessor::default());

    let services = Services::assemble(
        args,
        clock.clone(),
        Arc::new(MemoryNodeRepository::new()),
        Arc::new(MemoryBotInstanceRepository::new()),
        Arc::new(MemoryRecoveryLogRepository::new()),
        Arc::new(MemorySnapshotRepository::new()),
        Arc::new(MemoryTenantCustomerRepository::new()),
        Arc::new(MemoryNotificationRepository::new()),
        Arc::new(MemoryUndoGrantRepository::new()),
        Arc::new(MemoryLedgerStore::new()),
        Arc::new(MemoryMeterRepository::new()),
        Arc::new(MemObjectStore::default()),
        Arc::new(LogNotifier),
        Some(processor.clone()),
    )
    .expect("service graph");

    TestWorld {
        services: Arc::new(services),
        clock,
        processor,
    }
}

/// Register a node and return its record
pub async fn register_node(world: &TestWorld, node_id: &str, capacity_mb: u64) {
    world
        .services
        .fabric
        .register_node(&NodeRegistration {
            node_id: node_id.to_string(),
            host: format!("{}.local", node_id),
            capacity_mb,
            agent_version: "1.0.0".to_string(),
        })
        .await
        .expect("registration");
}

/// Insert a placed, active workload
pub async fn place_bot(
    world: &TestWorld,
    bot_id: &str,
    tenant: &str,
    tier: ResourceTier,
    node_id: &str,
) -> BotInstance {
    let now = world.clock.now_ms();
    let bot = BotInstance {
        id: bot_id.to_string(),
        tenant_id: tenant.to_string(),
        name: format!("{}-workload", bot_id),
        node_id: Some(node_id.to_string()),
        image: "registry.local/bot:1".to_string(),
        env: BTreeMap::new(),
        billing_state: BillingState::Active,
        suspended_at: None,
        destroy_after: None,
        resource_tier: tier,
        storage_tier: "standard".to_string(),
        created_at: now,
        updated_at: now,
    };
    world.services.bots.insert(&bot).await.expect("bot insert");
    world
        .services
        .fabric
        .reassign_tenant(bot_id, node_id)
        .await
        .expect("routing");
    bot
}

/// Credit a tenant so debits have something to consume
pub async fn fund(world: &TestWorld, tenant: &str, cents: i64) {
    world
        .services
        .ledger
        .credit(tenant, cents, TransactionType::Purchase, "test funding", None)
        .await
        .expect("funding");
}

// =============================================================================
// Scripted node agent
// =============================================================================

type CommandLog = Arc<StdMutex<Vec<(String, Value)>>>;

/// Per-command behavior knobs
#[derive(Default)]
pub struct AgentBehavior {
    /// Command types that respond with a failure result
    pub fail: StdMutex<HashSet<String>>,
    /// When set, `bot.inspect` reports the container as not running
    pub inspect_down: AtomicBool,
}

impl AgentBehavior {
    pub fn fail_on(&self, command: &str) {
        self.fail.lock().unwrap().insert(command.to_string());
    }

    pub fn heal(&self, command: &str) {
        self.fail.lock().unwrap().remove(command);
    }
}

enum Directive {
    Heartbeat(Vec<(String, u64)>),
    Close,
}

/// A fake node agent attached to the coordinator over an in-process duplex.
/// It answers every command (per its behavior) and records what it saw.
pub struct FakeAgent {
    pub node_id: String,
    pub commands: CommandLog,
    pub behavior: Arc<AgentBehavior>,
    directives: mpsc::Sender<Directive>,
}

impl FakeAgent {
    pub async fn connect(world: &TestWorld, node_id: &str) -> FakeAgent {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        world.services.fabric.clone().attach(node_id, server_ws);

        let mut client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let commands: CommandLog = Arc::new(StdMutex::new(Vec::new()));
        let behavior = Arc::new(AgentBehavior::default());
        let (directives, mut directive_rx) = mpsc::channel::<Directive>(16);

        let log = commands.clone();
        let agent_behavior = behavior.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = client_ws.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let frame: Value = match serde_json::from_str(&text) {
                                    Ok(v) => v,
                                    Err(_) => continue,
                                };
                                let command = frame["type"].as_str().unwrap_or("").to_string();
                                let id = frame["id"].as_str().unwrap_or("").to_string();
                                log.lock().unwrap().push((command.clone(), frame.clone()));

                                let reply = build_reply(&agent_behavior, &command, &id);
                                if client_ws.send(Message::Text(reply.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break,
                        }
                    }
                    directive = directive_rx.recv() => {
                        match directive {
                            Some(Directive::Heartbeat(containers)) => {
                                let frame = json!({
                                    "type": "heartbeat",
                                    "containers": containers.iter().map(|(name, mb)| {
                                        json!({"name": name, "memory_mb": mb})
                                    }).collect::<Vec<_>>(),
                                });
                                if client_ws.send(Message::Text(frame.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Directive::Close) | None => {
                                let _ = client_ws.close(None).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        FakeAgent {
            node_id: node_id.to_string(),
            commands,
            behavior,
            directives,
        }
    }

    /// Send one heartbeat frame and give the coordinator a beat to apply it
    pub async fn heartbeat(&self, containers: &[(&str, u64)]) {
        self.directives
            .send(Directive::Heartbeat(
                containers
                    .iter()
                    .map(|(n, m)| (n.to_string(), *m))
                    .collect(),
            ))
            .await
            .expect("agent alive");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.directives.send(Directive::Close).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    /// Command types received, in arrival order
    pub fn seen(&self) -> Vec<String> {
        self.commands.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Count of a given command type
    pub fn count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == command)
            .count()
    }
}

fn build_reply(behavior: &AgentBehavior, command: &str, id: &str) -> Value {
    if behavior.fail.lock().unwrap().contains(command) {
        return json!({
            "type": "command_result",
            "id": id,
            "command": command,
            "success": false,
            "error": format!("injected failure for {}", command),
        });
    }
    let data = match command {
        "bot.inspect" => json!({"running": !behavior.inspect_down.load(Ordering::SeqCst)}),
        "bot.export" => json!({"filename": "export.tar.gz", "size_bytes": 2048}),
        _ => json!({}),
    };
    json!({
        "type": "command_result",
        "id": id,
        "command": command,
        "success": true,
        "data": data,
    })
}

/// Poll until the predicate holds or a 2 s budget runs out
pub async fn eventually<F>(mut check: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("condition never held: {}", what);
}

/// `eventually` for async predicates (repository reads)
pub async fn eventually_async<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("condition never held: {}", what);
}
