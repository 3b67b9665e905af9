//! Channel fabric and node status machine, end to end over in-process
//! WebSockets

mod common;

use common::{eventually, register_node, world, FakeAgent};
use helmsman::types::Clock;
use helmsman::fabric::NodeCommand;
use helmsman::registry::{NodeStatus, RecoveryEvent, RecoveryStatus, RecoveryTrigger};

#[tokio::test]
async fn command_roundtrip_over_channel() {
    let w = world().await;
    register_node(&w, "n1", 4096).await;
    let agent = FakeAgent::connect(&w, "n1").await;

    let data = w
        .services
        .fabric
        .send_command("n1", NodeCommand::BotInspect {
            name: "bot-b1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(data["running"], true);
    assert_eq!(agent.seen(), vec!["bot.inspect"]);
}

#[tokio::test]
async fn heartbeat_updates_usage_and_liveness() {
    let w = world().await;
    register_node(&w, "n1", 4096).await;
    let agent = FakeAgent::connect(&w, "n1").await;

    w.clock.set(2_000_000);
    agent.heartbeat(&[("bot-a", 120), ("bot-b", 80)]).await;

    let node = w.services.nodes.get("n1").await.unwrap().unwrap();
    assert_eq!(node.used_mb, 200);
    assert_eq!(node.last_heartbeat_at, Some(2_000_000));
}

#[tokio::test]
async fn channel_close_fails_pending_commands() {
    let w = world().await;
    register_node(&w, "n1", 4096).await;
    let agent = FakeAgent::connect(&w, "n1").await;
    // The agent stops answering this command entirely by dropping its socket
    agent.disconnect().await;

    let err = w
        .services
        .fabric
        .send_command("n1", NodeCommand::BackupRunHot)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        helmsman::HelmsmanError::ChannelClosed(_)
    ));
    eventually(
        || w.services.fabric.connected_nodes().is_empty(),
        "channel detached",
    )
    .await;
}

/// Property 3: re-registration while recovering yields returning, never
/// active; heartbeats cannot flip it; placement skips it
#[tokio::test]
async fn status_machine_safety_around_recovery() {
    let w = world().await;
    register_node(&w, "n1", 8192).await;
    register_node(&w, "n2", 4096).await;

    // n1 goes dark and enters recovery
    w.services
        .nodes
        .set_status("n1", NodeStatus::Recovering, w.clock.now_ms())
        .await
        .unwrap();
    w.services
        .recovery_log
        .create_event(&RecoveryEvent {
            id: "e1".to_string(),
            node_id: "n1".to_string(),
            trigger: RecoveryTrigger::HeartbeatTimeout,
            status: RecoveryStatus::InProgress,
            total: 0,
            recovered: 0,
            failed: 0,
            waiting: 0,
            started_at: w.clock.now_ms(),
            completed_at: None,
            report: None,
        })
        .await
        .unwrap();

    // The node boots back and re-registers mid-recovery
    register_node(&w, "n1", 8192).await;
    let node = w.services.nodes.get("n1").await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Returning);

    // The in-flight event was closed
    let event = w.services.recovery_log.get_event("e1").await.unwrap().unwrap();
    assert_eq!(event.status, RecoveryStatus::Completed);
    assert!(event.completed_at.is_some());

    // Heartbeats do not promote a returning node
    let agent = FakeAgent::connect(&w, "n1").await;
    agent.heartbeat(&[]).await;
    assert_eq!(
        w.services.nodes.get("n1").await.unwrap().unwrap().status,
        NodeStatus::Returning
    );

    // Placement of new work avoids the returning node despite its free space
    let target = w
        .services
        .fabric
        .find_best_target(None, 100)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target.id, "n2");
}

/// S1: greatest-free-first placement, then saturation, then exhaustion
#[tokio::test]
async fn placement_scenario_over_fleet() {
    let w = world().await;
    register_node(&w, "n1", 8192).await;
    register_node(&w, "n2", 4096).await;

    let target = w.services.fabric.find_best_target(None, 100).await.unwrap();
    assert_eq!(target.unwrap().id, "n1");

    w.services
        .nodes
        .update_heartbeat("n1", 8_100, w.clock.now_ms())
        .await
        .unwrap();
    let target = w.services.fabric.find_best_target(None, 100).await.unwrap();
    assert_eq!(target.unwrap().id, "n2");

    w.services
        .nodes
        .update_heartbeat("n2", 4_000, w.clock.now_ms())
        .await
        .unwrap();
    assert!(w
        .services
        .fabric
        .find_best_target(None, 100)
        .await
        .unwrap()
        .is_none());
}
