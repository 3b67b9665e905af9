//! Bulk operations and the grant undo window

mod common;

use common::{fund, place_bot, register_node, world};
use helmsman::types::Clock;
use helmsman::billing::BulkAction;
use helmsman::registry::{BillingState, ResourceTier, UndoStatus};

/// S6 + property 7: a bulk grant is invertible inside its five-minute
/// window, exactly once
#[tokio::test]
async fn bulk_grant_undo_inside_window() {
    let w = world().await;
    let tenants = vec!["t1".to_string(), "t2".to_string(), "t3".to_string()];
    for t in &tenants {
        fund(&w, t, 40).await;
    }

    let report = w
        .services
        .bulk
        .execute(BulkAction::Grant { amount_cents: 100 }, &tenants)
        .await
        .unwrap();
    let operation_id = report.operation_id.clone().expect("operation id");
    assert_eq!(
        report.undo_deadline,
        Some(w.clock.now_ms() + 5 * 60 * 1000)
    );
    assert_eq!(report.succeeded.len(), 3);
    for t in &tenants {
        assert_eq!(w.services.ledger.balance_cents(t).await.unwrap(), 140);
    }

    // Two minutes later: undo restores pre-grant balances
    w.clock.advance(2 * 60 * 1000);
    let undo = w.services.bulk.undo_grant(&operation_id).await.unwrap();
    assert_eq!(undo.status, UndoStatus::Undone);
    assert_eq!(undo.corrected.len(), 3);
    for t in &tenants {
        assert_eq!(w.services.ledger.balance_cents(t).await.unwrap(), 40);
        // One negative correction row exists per tenant
        let corrections = w
            .services
            .ledger
            .transactions(t)
            .await
            .unwrap()
            .into_iter()
            .filter(|tx| tx.amount_cents == -100)
            .count();
        assert_eq!(corrections, 1);
    }

    // A second undo fails
    let err = w.services.bulk.undo_grant(&operation_id).await.unwrap_err();
    assert!(matches!(err, helmsman::HelmsmanError::Conflict(_)));
}

#[tokio::test]
async fn undo_after_window_fails() {
    let w = world().await;
    let tenants = vec!["t1".to_string()];
    let report = w
        .services
        .bulk
        .execute(BulkAction::Grant { amount_cents: 100 }, &tenants)
        .await
        .unwrap();
    let operation_id = report.operation_id.unwrap();

    w.clock.advance(5 * 60 * 1000 + 1);
    let err = w.services.bulk.undo_grant(&operation_id).await.unwrap_err();
    assert!(matches!(err, helmsman::HelmsmanError::BadRequest(_)));
    // The grant stands
    assert_eq!(w.services.ledger.balance_cents("t1").await.unwrap(), 100);
}

/// Undoing twice concurrently or replaying the undo corrections cannot
/// double-correct thanks to the per-tenant references
#[tokio::test]
async fn undo_corrections_are_reference_protected() {
    let w = world().await;
    let tenants = vec!["t1".to_string(), "t2".to_string()];
    let report = w
        .services
        .bulk
        .execute(BulkAction::Grant { amount_cents: 250 }, &tenants)
        .await
        .unwrap();
    let operation_id = report.operation_id.unwrap();

    w.services.bulk.undo_grant(&operation_id).await.unwrap();
    for t in &tenants {
        assert_eq!(w.services.ledger.balance_cents(t).await.unwrap(), 0);
    }
    // Direct replay of a correction reference is a no-op
    let replay = w
        .services
        .ledger
        .correct("t1", -250, "undo replay", Some(&format!("undo-{}-t1", operation_id)))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(w.services.ledger.balance_cents("t1").await.unwrap(), 0);
}

#[tokio::test]
async fn bulk_validation_rejects_bad_input() {
    let w = world().await;

    // Size cap
    let too_many: Vec<String> = (0..501).map(|i| format!("t{}", i)).collect();
    assert!(w
        .services
        .bulk
        .execute(BulkAction::Grant { amount_cents: 100 }, &too_many)
        .await
        .is_err());

    // Malformed tenant id rejected before anything applies
    let bad = vec!["ok-tenant".to_string(), "bad tenant!".to_string()];
    assert!(w
        .services
        .bulk
        .execute(BulkAction::Grant { amount_cents: 100 }, &bad)
        .await
        .is_err());
    assert_eq!(w.services.ledger.balance_cents("ok-tenant").await.unwrap(), 0);

    // Empty list
    assert!(w.services.bulk.execute(BulkAction::Export, &[]).await.is_err());
}

/// Forbidden per-tenant transitions fail per item, not the whole bulk
#[tokio::test]
async fn bulk_suspend_isolates_per_tenant_failures() {
    let w = world().await;
    register_node(&w, "n1", 8192).await;
    place_bot(&w, "b1", "t1", ResourceTier::Free, "n1").await;

    // t2 has a destroyed instance: suspending the tenant is a no-op, but a
    // direct instance suspension is a forbidden transition
    let destroyed = place_bot(&w, "b2", "t2", ResourceTier::Free, "n1").await;
    w.services
        .bots
        .set_billing_state(
            &destroyed.id,
            BillingState::Destroyed,
            None,
            None,
            w.clock.now_ms(),
        )
        .await
        .unwrap();
    assert!(w
        .services
        .billing
        .suspend_instance_by_id("b2")
        .await
        .is_err());

    let report = w
        .services
        .bulk
        .execute(
            BulkAction::Suspend,
            &["t1".to_string(), "t2".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(
        w.services.bots.get("b1").await.unwrap().unwrap().billing_state,
        BillingState::Suspended
    );
    assert_eq!(
        w.services.bots.get("b2").await.unwrap().unwrap().billing_state,
        BillingState::Destroyed
    );

    // Export reflects both tenants regardless
    let export = w
        .services
        .bulk
        .execute(
            BulkAction::Export,
            &["t1".to_string(), "t2".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(export.exported.len(), 2);
}
