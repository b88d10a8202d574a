use chrono::Utc;
use paycycle::domain::attempt::{AttemptStatus, PaymentAttempt};
use paycycle::domain::ports::{
    AttemptStore, Ledger, QueueTask, SharedAttemptStore, SharedLedger, SharedWebhookStore,
    SharedWorkQueue, WebhookStore, WorkQueue,
};
use paycycle::domain::webhook::{PaymentWebhook, WebhookStatus};
use paycycle::infrastructure::in_memory::{
    InMemoryAttemptStore, InMemoryLedger, InMemoryWebhookStore, InMemoryWorkQueue,
};
use std::sync::Arc;

mod common;

#[tokio::test]
async fn test_stores_as_trait_objects() {
    let attempts: SharedAttemptStore = Arc::new(InMemoryAttemptStore::new());
    let webhooks: SharedWebhookStore = Arc::new(InMemoryWebhookStore::new());
    let queue: SharedWorkQueue = Arc::new(InMemoryWorkQueue::new());
    let ledger: SharedLedger = Arc::new(InMemoryLedger::new());

    let attempt = PaymentAttempt::pending(1, 1, 1, common::stripe(), Utc::now());
    let webhook = PaymentWebhook::new(
        "evt_1",
        common::stripe(),
        "invoice.paid",
        serde_json::Value::Null,
        Utc::now(),
    );

    // Verify Send + Sync by spawning tasks
    let attempt_handle = tokio::spawn(async move {
        attempts.insert(attempt).await.unwrap();
        attempts.find_by_contribution(1).await.unwrap().unwrap()
    });
    let webhook_handle = tokio::spawn(async move {
        let logged = webhooks.insert(webhook).await.unwrap().into_inner();
        queue
            .create(&common::stripe(), QueueTask { webhook_id: logged.id })
            .await
            .unwrap();
        let claimed = queue.claim(&common::stripe()).await.unwrap().unwrap();
        (logged, claimed)
    });
    let ledger_handle =
        tokio::spawn(async move { ledger.get_contributions(&[1, 2]).await.unwrap() });

    let attempt = attempt_handle.await.unwrap();
    assert_eq!(attempt.contribution_id, 1);

    let (logged, claimed) = webhook_handle.await.unwrap();
    assert_eq!(logged.status, WebhookStatus::New);
    assert_eq!(claimed.task.webhook_id, logged.id);

    assert!(ledger_handle.await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claim_has_one_winner() {
    let store: SharedAttemptStore = Arc::new(InMemoryAttemptStore::new());
    let attempt = PaymentAttempt::pending(1, 1, 1, common::stripe(), Utc::now());
    let id = attempt.id;
    store.insert(attempt).await.unwrap();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .compare_and_set_status(
                        id,
                        AttemptStatus::Pending,
                        AttemptStatus::Processing,
                        Utc::now(),
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        AttemptStatus::Processing
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_insert_keeps_one_attempt_per_contribution() {
    let store: SharedAttemptStore = Arc::new(InMemoryAttemptStore::new());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let attempt = PaymentAttempt::pending(42, 1, 1, common::stripe(), Utc::now());
                store.insert(attempt).await.unwrap()
            })
        })
        .collect();

    let mut inserted = Vec::new();
    let mut duplicates = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.is_duplicate() {
            duplicates += 1;
        } else {
            inserted.push(outcome.into_inner());
        }
    }
    assert_eq!(inserted.len(), 1);
    assert_eq!(duplicates, 7);
    assert_eq!(
        store.find_by_contribution(42).await.unwrap(),
        Some(inserted.remove(0))
    );
}
