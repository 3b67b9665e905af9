//! Recovery ordering, capacity pressure, and retry behavior

mod common;

use common::{place_bot, register_node, world, FakeAgent};
use helmsman::types::Clock;
use helmsman::registry::{NodeStatus, RecoveryItemStatus, RecoveryStatus, RecoveryTrigger, ResourceTier};

/// Property 4: tiers recover enterprise > pro > starter > free, ids
/// ascending within a tier
#[tokio::test]
async fn recovery_processes_tiers_in_priority_order() {
    let w = world().await;
    register_node(&w, "n1", 8192).await;
    register_node(&w, "n2", 8192).await;
    let target_agent = FakeAgent::connect(&w, "n2").await;

    place_bot(&w, "b1", "t-free-a", ResourceTier::Free, "n1").await;
    place_bot(&w, "b2", "t-ent", ResourceTier::Enterprise, "n1").await;
    place_bot(&w, "b3", "t-pro", ResourceTier::Pro, "n1").await;
    place_bot(&w, "b4", "t-free-b", ResourceTier::Free, "n1").await;
    place_bot(&w, "b5", "t-starter", ResourceTier::Starter, "n1").await;

    let summary = w
        .services
        .recovery
        .recover_node("n1", RecoveryTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(summary.recovered, 5);
    assert_eq!(summary.status, RecoveryStatus::Completed);

    // The import order on the target encodes the processing order
    let imports: Vec<String> = target_agent
        .commands
        .lock()
        .unwrap()
        .iter()
        .filter(|(c, _)| c == "bot.import")
        .map(|(_, frame)| frame["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        imports,
        vec!["bot-b2", "bot-b3", "bot-b5", "bot-b1", "bot-b4"]
    );

    // Everyone moved to n2 and the dead node rests offline
    for bot_id in ["b1", "b2", "b3", "b4", "b5"] {
        assert_eq!(
            w.services.bots.get(bot_id).await.unwrap().unwrap().node_id.as_deref(),
            Some("n2")
        );
    }
    assert_eq!(
        w.services.nodes.get("n1").await.unwrap().unwrap().status,
        NodeStatus::Offline
    );
}

/// S2: with 200 MB free on the only target and 100 MB per tenant, the free
/// tenant ends up waiting; adding capacity and retrying completes the event
#[tokio::test]
async fn capacity_pressure_parks_lowest_tier_then_retry_completes() {
    let w = world().await;
    register_node(&w, "n1", 8192).await;
    register_node(&w, "n2", 4096).await;
    let _agent = FakeAgent::connect(&w, "n2").await;

    // n2 reports only 200 MB free
    w.services
        .nodes
        .update_heartbeat("n2", 3_896, w.clock.now_ms())
        .await
        .unwrap();

    place_bot(&w, "b1", "t-free", ResourceTier::Free, "n1").await;
    place_bot(&w, "b2", "t-pro", ResourceTier::Pro, "n1").await;
    place_bot(&w, "b3", "t-ent", ResourceTier::Enterprise, "n1").await;

    let mut overflow_rx = w.services.events.subscribe();
    let summary = w
        .services
        .recovery
        .recover_node("n1", RecoveryTrigger::HeartbeatTimeout)
        .await
        .unwrap();

    assert_eq!(summary.recovered, 2);
    assert_eq!(summary.waiting, 1);
    assert_eq!(summary.status, RecoveryStatus::Partial);

    let items = w
        .services
        .recovery_log
        .list_items(&summary.event_id)
        .await
        .unwrap();
    let waiting: Vec<_> = items
        .iter()
        .filter(|i| i.status == RecoveryItemStatus::Waiting)
        .collect();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].tenant_id, "t-free");
    assert_eq!(waiting[0].reason.as_deref(), Some("no_capacity"));

    // The overflow signal fired
    let mut saw_overflow = false;
    while let Ok(event) = overflow_rx.try_recv() {
        if matches!(event, helmsman::events::FleetEvent::CapacityOverflow { .. }) {
            saw_overflow = true;
        }
    }
    assert!(saw_overflow);

    // Capacity returns on n2; retry drains the waiting item
    w.services
        .nodes
        .update_heartbeat("n2", 200, w.clock.now_ms())
        .await
        .unwrap();
    let retried = w
        .services
        .recovery
        .retry_waiting(&summary.event_id)
        .await
        .unwrap();
    assert_eq!(retried.waiting, 0);
    assert_eq!(retried.status, RecoveryStatus::Completed);

    let items = w
        .services
        .recovery_log
        .list_items(&summary.event_id)
        .await
        .unwrap();
    assert!(items
        .iter()
        .any(|i| i.tenant_id == "t-free" && i.status == RecoveryItemStatus::Retried));
}

/// Per-tenant failures are recorded and do not abort the run
#[tokio::test]
async fn tenant_failure_is_contained() {
    let w = world().await;
    register_node(&w, "n1", 8192).await;
    register_node(&w, "n2", 8192).await;
    let agent = FakeAgent::connect(&w, "n2").await;
    agent.behavior.fail_on("backup.download");

    place_bot(&w, "b1", "t1", ResourceTier::Pro, "n1").await;
    place_bot(&w, "b2", "t2", ResourceTier::Free, "n1").await;

    let summary = w
        .services
        .recovery
        .recover_node("n1", RecoveryTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.recovered, 0);
    // Failures are not `waiting`, so the event still completes
    assert_eq!(summary.status, RecoveryStatus::Completed);

    // The assignments never moved; once the downloads work again a fresh
    // manual recovery relocates both tenants
    agent.behavior.heal("backup.download");
    let rerun = w
        .services
        .recovery
        .recover_node("n1", RecoveryTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(rerun.total, 2);
    assert_eq!(rerun.recovered, 2);
}
