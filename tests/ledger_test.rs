//! Ledger consistency and idempotency properties

mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use common::{fund, place_bot, world};
use helmsman::db::Db;
use helmsman::ledger::{CreditLedger, MemoryLedgerStore, SqliteLedgerStore, TransactionType};
use helmsman::registry::{BillingState, ResourceTier};
use helmsman::types::ManualClock;

/// Property 1: balance equals the transaction sum under random interleavings
#[tokio::test]
async fn balance_equals_transaction_sum_under_interleaving() {
    for seed in 0..5u64 {
        let clock = ManualClock::new(1_000);
        let ledger = Arc::new(CreditLedger::new(
            Arc::new(MemoryLedgerStore::new()),
            clock.clone(),
        ));
        let mut rng = StdRng::seed_from_u64(seed);
        let tenants = ["t1", "t2", "t3"];

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let tenant = tenants[rng.gen_range(0..tenants.len())].to_string();
            let amount = rng.gen_range(1..500i64);
            let credit = rng.gen_bool(0.6);
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                if credit {
                    let _ = ledger
                        .credit(&tenant, amount, TransactionType::Purchase, "p", None)
                        .await;
                } else {
                    let _ = ledger
                        .debit(&tenant, amount, TransactionType::Usage, "u", None)
                        .await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for tenant in tenants {
            let txs = ledger.transactions(tenant).await.unwrap();
            let sum: i64 = txs.iter().map(|t| t.amount_cents).sum();
            assert_eq!(
                ledger.balance_cents(tenant).await.unwrap(),
                sum,
                "seed {} tenant {}",
                seed,
                tenant
            );
            // Every row's running balance is consistent with its predecessor
            let mut running = 0;
            for tx in txs {
                running += tx.amount_cents;
                assert_eq!(tx.balance_after_cents, running);
            }
        }
    }
}

/// Property 2: a duplicated reference advances the balance once
#[tokio::test]
async fn duplicate_reference_applies_once() {
    let clock = ManualClock::new(1_000);
    let db = Db::open_in_memory().unwrap();
    let ledger = CreditLedger::new(Arc::new(SqliteLedgerStore::new(db)), clock);

    let first = ledger
        .credit("t1", 2_500, TransactionType::Purchase, "purchase", Some("ref-X"))
        .await
        .unwrap();
    let second = ledger
        .credit("t1", 2_500, TransactionType::Purchase, "purchase", Some("ref-X"))
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.transaction.id, second.transaction.id);
    assert_eq!(ledger.balance_cents("t1").await.unwrap(), 2_500);
    assert_eq!(ledger.transactions("t1").await.unwrap().len(), 1);
}

/// S5: a purchase webhook delivered twice credits once and reactivates the
/// tenant's suspended workloads
#[tokio::test]
async fn replayed_purchase_webhook_reactivates_once() {
    let w = world().await;
    common::register_node(&w, "n1", 4096).await;
    place_bot(&w, "b1", "t1", ResourceTier::Pro, "n1").await;

    // Drain the balance to zero; billing suspends the workload
    fund(&w, "t1", 100).await;
    w.services
        .ledger
        .debit("t1", 100, TransactionType::Usage, "usage", None)
        .await
        .unwrap();
    w.services
        .billing
        .suspend_tenant("t1", "credit balance exhausted")
        .await
        .unwrap();
    assert_eq!(
        w.services.bots.get("b1").await.unwrap().unwrap().billing_state,
        BillingState::Suspended
    );

    // $25.00 purchase arrives twice with the same reference
    for _ in 0..2 {
        w.services
            .ledger
            .credit("t1", 2_500, TransactionType::Purchase, "card purchase", Some("ref-X"))
            .await
            .unwrap();
        w.services.billing.check_reactivation("t1").await.unwrap();
    }

    assert_eq!(w.services.ledger.balance_cents("t1").await.unwrap(), 2_500);
    assert_eq!(w.services.ledger.transactions("t1").await.unwrap().len(), 3);
    assert_eq!(
        w.services.bots.get("b1").await.unwrap().unwrap().billing_state,
        BillingState::Active
    );
}
