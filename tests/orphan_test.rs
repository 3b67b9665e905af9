//! Orphan cleanup on returning nodes (end to end through the event bus)

mod common;

use common::{eventually, eventually_async, place_bot, register_node, world, FakeAgent};
use helmsman::types::Clock;
use helmsman::orchestrator::spawn_orphan_listener;
use helmsman::registry::{NodeStatus, ResourceTier};

async fn returning_node(w: &common::TestWorld, node_id: &str) {
    register_node(w, node_id, 8192).await;
    w.services
        .nodes
        .set_status(node_id, NodeStatus::Offline, w.clock.now_ms())
        .await
        .unwrap();
    register_node(w, node_id, 8192).await;
    assert_eq!(
        w.services.nodes.get(node_id).await.unwrap().unwrap().status,
        NodeStatus::Returning
    );
}

/// S4 + property 6: both orphans stopped exactly once, node promoted to
/// active exactly once, the second heartbeat reissues nothing
#[tokio::test]
async fn returning_node_orphans_are_stopped_once() {
    let w = world().await;
    let _listener = spawn_orphan_listener(w.services.orphan.clone(), w.services.events.clone());

    returning_node(&w, "n1").await;
    register_node(&w, "n2", 8192).await;

    // Both workloads were recovered onto n2 while n1 was away
    place_bot(&w, "b1", "tenant-a", ResourceTier::Free, "n2").await;
    place_bot(&w, "b2", "tenant-b", ResourceTier::Free, "n2").await;

    let agent = FakeAgent::connect(&w, "n1").await;
    agent.heartbeat(&[("bot-b1", 64), ("bot-b2", 64)]).await;

    eventually(|| agent.count("bot.stop") == 2, "both orphans stopped").await;
    eventually_async(
        || async {
            w.services.nodes.get("n1").await.unwrap().unwrap().status == NodeStatus::Active
        },
        "node promoted to active",
    )
    .await;

    // Same inventory again: no new stops, no double promotion
    agent.heartbeat(&[("bot-b1", 64), ("bot-b2", 64)]).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(agent.count("bot.stop"), 2);
    assert_eq!(
        w.services.nodes.get("n1").await.unwrap().unwrap().status,
        NodeStatus::Active
    );
}

/// A container whose workload is assigned to the returning node is kept
#[tokio::test]
async fn reassigned_back_container_is_kept() {
    let w = world().await;
    let _listener = spawn_orphan_listener(w.services.orphan.clone(), w.services.events.clone());

    returning_node(&w, "n1").await;
    register_node(&w, "n2", 8192).await;
    place_bot(&w, "b1", "tenant-a", ResourceTier::Free, "n1").await;
    place_bot(&w, "b2", "tenant-b", ResourceTier::Free, "n2").await;

    let agent = FakeAgent::connect(&w, "n1").await;
    agent.heartbeat(&[("bot-b1", 64), ("bot-b2", 64)]).await;

    eventually(|| agent.count("bot.stop") == 1, "only the orphan stopped").await;
    let stopped: Vec<String> = agent
        .commands
        .lock()
        .unwrap()
        .iter()
        .filter(|(c, _)| c == "bot.stop")
        .map(|(_, f)| f["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(stopped, vec!["bot-b2"]);
}

/// A failed stop leaves the node returning; a fresh connection retries
#[tokio::test]
async fn partial_sweep_keeps_node_returning_until_reconnect() {
    let w = world().await;
    let _listener = spawn_orphan_listener(w.services.orphan.clone(), w.services.events.clone());

    returning_node(&w, "n1").await;
    register_node(&w, "n2", 8192).await;
    place_bot(&w, "b1", "tenant-a", ResourceTier::Free, "n2").await;

    let agent = FakeAgent::connect(&w, "n1").await;
    agent.behavior.fail_on("bot.stop");
    agent.heartbeat(&[("bot-b1", 64)]).await;

    eventually(|| agent.count("bot.stop") == 1, "stop attempted").await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(
        w.services.nodes.get("n1").await.unwrap().unwrap().status,
        NodeStatus::Returning
    );

    // Same connection: the guard holds even across more heartbeats
    agent.heartbeat(&[("bot-b1", 64)]).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(agent.count("bot.stop"), 1);

    // A reconnect gets a fresh guard and a working stop
    agent.disconnect().await;
    let agent2 = FakeAgent::connect(&w, "n1").await;
    agent2.heartbeat(&[("bot-b1", 64)]).await;
    eventually(|| agent2.count("bot.stop") == 1, "stop retried on reconnect").await;
    eventually_async(
        || async {
            w.services.nodes.get("n1").await.unwrap().unwrap().status == NodeStatus::Active
        },
        "node active after clean sweep",
    )
    .await;
}
