use async_trait::async_trait;
use chrono::{Duration, Utc};
use paycycle::application::attempts::AttemptLedger;
use paycycle::application::context::RunContext;
use paycycle::application::reconcile::{
    ReconcileRequest, ReconcileSummary, ReconciliationOrchestrator, StuckThreshold,
};
use paycycle::domain::attempt::{AttemptStatus, PaymentAttempt};
use paycycle::domain::events::{PaymentEvent, ReconcileOutcome};
use paycycle::domain::ledger::{ContributionStatus, TransactionCompletion};
use paycycle::domain::ports::{AttemptStore, Clock, SharedAttemptStore};
use paycycle::domain::processor::ProcessorType;
use paycycle::error::{PaymentError, Result};
use paycycle::infrastructure::clock::ManualClock;
use paycycle::infrastructure::event_bus::{EventSubscriber, InProcessEventBus};
use paycycle::infrastructure::in_memory::{InMemoryAttemptStore, InMemoryLedger};
use rand::Rng;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::Barrier;

mod common;

struct World {
    clock: ManualClock,
    store: SharedAttemptStore,
    ledger: InMemoryLedger,
    next_id: u64,
}

impl World {
    fn new() -> Self {
        Self {
            clock: ManualClock::new(Utc::now()),
            store: Arc::new(InMemoryAttemptStore::new()),
            ledger: InMemoryLedger::new(),
            next_id: 1,
        }
    }

    /// A pending contribution on its own schedule with an attempt stuck for
    /// `days_stuck` days.
    async fn stuck(
        &mut self,
        processor: &ProcessorType,
        days_stuck: i64,
        failure_count: u32,
        pay_later: bool,
    ) -> PaymentAttempt {
        let id = self.next_id;
        self.next_id += 1;
        let mut schedule = common::schedule(id, processor.clone());
        schedule.failure_count = failure_count;
        let mut contribution =
            common::contribution(id, &schedule, dec!(50.00), common::date(2026, 1, 1));
        contribution.is_pay_later = pay_later;
        self.ledger.insert_recurring(schedule).await;
        self.ledger.insert_contribution(contribution.clone()).await;
        common::stuck_attempt(
            self.store.as_ref(),
            &contribution,
            processor,
            self.clock.now() - Duration::days(days_stuck),
        )
        .await
    }

    fn orchestrator(&self, bus: InProcessEventBus) -> ReconciliationOrchestrator {
        let ctx = RunContext::new(Arc::new(self.clock.clone()));
        ReconciliationOrchestrator::new(
            AttemptLedger::new(self.store.clone(), ctx.clone()),
            Arc::new(self.ledger.clone()),
            Arc::new(bus),
            ctx,
        )
    }

    async fn status(&self, attempt: &PaymentAttempt) -> AttemptStatus {
        self.store.get(attempt.id).await.unwrap().unwrap().status
    }
}

fn request(thresholds: &[(&ProcessorType, u32)], batch_size: usize) -> ReconcileRequest {
    ReconcileRequest {
        thresholds: thresholds
            .iter()
            .map(|(processor_type, days)| StuckThreshold {
                processor_type: (*processor_type).clone(),
                days: *days,
            })
            .collect(),
        batch_size,
        max_retry_count: 3,
    }
}

async fn run_single(
    world: &World,
    script: impl Fn(&PaymentAttempt) -> Option<ReconcileOutcome> + Send + Sync + 'static,
) -> ReconcileSummary {
    let reconciler = common::ScriptedReconciler::new(common::stripe(), script);
    world
        .orchestrator(InProcessEventBus::new().with_subscriber(reconciler))
        .run(&request(&[(&common::stripe(), 2)], 100))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_shared_budget_across_processors() {
    let stripe = common::stripe();
    let gocardless = common::processor("gocardless");
    let mut rng = rand::thread_rng();

    for _ in 0..25 {
        let n1 = rng.gen_range(0..8usize);
        let n2 = rng.gen_range(0..8usize);
        let budget = rng.gen_range(0..12usize);

        for (first, second) in [(&stripe, &gocardless), (&gocardless, &stripe)] {
            let mut world = World::new();
            for _ in 0..n1 {
                world.stuck(first, 3, 0, false).await;
            }
            for _ in 0..n2 {
                world.stuck(second, 3, 0, false).await;
            }
            let first_seen =
                common::ScriptedReconciler::new(first.clone(), |_| Some(ReconcileOutcome::Unchanged));
            let second_seen =
                common::ScriptedReconciler::new(second.clone(), |_| Some(ReconcileOutcome::Unchanged));
            let bus = InProcessEventBus::new()
                .with_subscriber(first_seen.clone())
                .with_subscriber(second_seen.clone());

            let summary = world
                .orchestrator(bus)
                .run(&request(&[(first, 2), (second, 2)], budget))
                .await
                .unwrap();

            let expected_first = n1.min(budget);
            let expected_second = n2.min(budget - expected_first);
            assert_eq!(summary.processors.len(), 2);
            assert_eq!(summary.processors[0].processor_type, *first);
            assert_eq!(summary.processors[0].examined, expected_first);
            assert_eq!(summary.processors[1].examined, expected_second);
            assert!(summary.examined() <= budget);
            assert_eq!(summary.unchanged(), summary.examined());

            // A processor with no budget left is never asked.
            let expected_calls = |remaining: usize, n: usize| {
                if remaining == 0 { vec![] } else { vec![n.min(remaining)] }
            };
            assert_eq!(first_seen.batch_sizes(), expected_calls(budget, n1));
            assert_eq!(
                second_seen.batch_sizes(),
                expected_calls(budget - expected_first, n2)
            );
        }
    }
}

#[tokio::test]
async fn test_threshold_selects_only_old_attempts() {
    let mut world = World::new();
    let old = world.stuck(&common::stripe(), 3, 0, false).await;
    let recent = world.stuck(&common::stripe(), 1, 0, false).await;

    let summary = run_single(&world, |_| Some(ReconcileOutcome::Unchanged)).await;

    assert_eq!(summary.examined(), 1);
    assert_eq!(summary.unchanged(), 1);
    assert_eq!(world.status(&old).await, AttemptStatus::Processing);
    assert_eq!(world.status(&recent).await, AttemptStatus::Processing);
}

#[tokio::test]
async fn test_failure_at_retry_limit_fails_contribution_unless_pay_later() {
    let mut world = World::new();
    let regular = world.stuck(&common::stripe(), 3, 3, false).await;
    let pay_later = world.stuck(&common::stripe(), 3, 3, true).await;
    let below_limit = world.stuck(&common::stripe(), 3, 0, false).await;

    let summary = run_single(&world, |_| {
        Some(ReconcileOutcome::Failed {
            reason: Some("card_declined".to_string()),
        })
    })
    .await;
    assert_eq!(summary.reconciled(), 3);
    assert_eq!(summary.errored(), 0);

    for attempt in [&regular, &pay_later, &below_limit] {
        assert_eq!(world.status(attempt).await, AttemptStatus::Failed);
    }

    let regular_contribution = world.ledger.contribution(regular.contribution_id).await.unwrap();
    assert_eq!(regular_contribution.status, ContributionStatus::Failed);
    let pay_later_contribution = world
        .ledger
        .contribution(pay_later.contribution_id)
        .await
        .unwrap();
    assert_eq!(pay_later_contribution.status, ContributionStatus::Pending);
    let below_contribution = world
        .ledger
        .contribution(below_limit.contribution_id)
        .await
        .unwrap();
    assert_eq!(below_contribution.status, ContributionStatus::Pending);

    for (attempt, failures) in [(&regular, 4), (&pay_later, 4), (&below_limit, 1)] {
        let recurring_id = world
            .ledger
            .contribution(attempt.contribution_id)
            .await
            .unwrap()
            .recurring_id
            .unwrap();
        let schedule = world.ledger.recurring(recurring_id).await.unwrap();
        assert_eq!(schedule.failure_count, failures);
    }
}

#[tokio::test]
async fn test_completion_records_payment() {
    let mut world = World::new();
    let with_data = world.stuck(&common::stripe(), 3, 0, false).await;
    let without_data = world.stuck(&common::stripe(), 3, 0, false).await;
    let paid = with_data.contribution_id;

    let summary = run_single(&world, move |attempt| {
        let completion = (attempt.contribution_id == paid).then(|| TransactionCompletion {
            contribution_id: paid,
            trxn_id: "ch_123".to_string(),
            amount: dec!(50.00),
            fee_amount: Some(dec!(1.20)),
            trxn_date: common::date(2026, 1, 2),
        });
        Some(ReconcileOutcome::Completed(completion))
    })
    .await;
    assert_eq!(summary.reconciled(), 2);

    assert_eq!(world.status(&with_data).await, AttemptStatus::Completed);
    assert_eq!(world.status(&without_data).await, AttemptStatus::Completed);

    let completed = world.ledger.contribution(paid).await.unwrap();
    assert_eq!(completed.status, ContributionStatus::Completed);
    assert_eq!(completed.paid_amount, dec!(50.00));
    let untouched = world
        .ledger
        .contribution(without_data.contribution_id)
        .await
        .unwrap();
    assert_eq!(untouched.status, ContributionStatus::Pending);
}

#[tokio::test]
async fn test_cancellation_fails_pending_contribution() {
    let mut world = World::new();
    let regular = world.stuck(&common::stripe(), 3, 0, false).await;
    let pay_later = world.stuck(&common::stripe(), 3, 0, true).await;

    let summary = run_single(&world, |_| Some(ReconcileOutcome::Cancelled)).await;
    assert_eq!(summary.reconciled(), 2);

    assert_eq!(world.status(&regular).await, AttemptStatus::Cancelled);
    assert_eq!(world.status(&pay_later).await, AttemptStatus::Cancelled);
    assert_eq!(
        world
            .ledger
            .contribution(regular.contribution_id)
            .await
            .unwrap()
            .status,
        ContributionStatus::Failed
    );
    assert_eq!(
        world
            .ledger
            .contribution(pay_later.contribution_id)
            .await
            .unwrap()
            .status,
        ContributionStatus::Pending
    );
}

#[tokio::test]
async fn test_unanswered_attempts_are_unhandled() {
    let mut world = World::new();
    let answered = world.stuck(&common::stripe(), 3, 0, false).await;
    let ignored = world.stuck(&common::stripe(), 3, 0, false).await;
    let answered_id = answered.id;

    let summary = run_single(&world, move |attempt| {
        (attempt.id == answered_id).then_some(ReconcileOutcome::Unchanged)
    })
    .await;

    assert_eq!(summary.examined(), 2);
    assert_eq!(summary.unchanged(), 1);
    assert_eq!(summary.unhandled(), 1);
    assert_eq!(world.status(&ignored).await, AttemptStatus::Processing);
}

#[tokio::test]
async fn test_no_subscribers_leaves_everything_unhandled() {
    let mut world = World::new();
    world.stuck(&common::stripe(), 3, 0, false).await;
    world.stuck(&common::stripe(), 3, 0, false).await;

    let summary = world
        .orchestrator(InProcessEventBus::new())
        .run(&request(&[(&common::stripe(), 2)], 100))
        .await
        .unwrap();

    assert_eq!(summary.examined(), 2);
    assert_eq!(summary.unhandled(), 2);
}

struct BrokenReconciler;

#[async_trait]
impl EventSubscriber for BrokenReconciler {
    async fn on_event(&self, _event: &mut PaymentEvent) -> Result<()> {
        Err(PaymentError::HandlerError("processor API unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_subscriber_failure_counts_batch_as_errored() {
    let mut world = World::new();
    let attempt = world.stuck(&common::stripe(), 3, 0, false).await;
    world.stuck(&common::processor("gocardless"), 7, 0, false).await;

    let summary = world
        .orchestrator(InProcessEventBus::new().with_subscriber(Arc::new(BrokenReconciler)))
        .run(&request(
            &[(&common::stripe(), 2), (&common::processor("gocardless"), 6)],
            100,
        ))
        .await
        .unwrap();

    assert_eq!(summary.processors[0].examined, 1);
    assert_eq!(summary.processors[0].errored, 1);
    assert_eq!(summary.processors[1].errored, 1);
    assert_eq!(world.status(&attempt).await, AttemptStatus::Processing);
}

/// Holds each batch until both runs have selected theirs.
struct GatedReconciler {
    gate: Barrier,
}

#[async_trait]
impl EventSubscriber for GatedReconciler {
    async fn on_event(&self, event: &mut PaymentEvent) -> Result<()> {
        let PaymentEvent::ReconcileBatch(batch) = event else {
            return Ok(());
        };
        self.gate.wait().await;
        let ids: Vec<_> = batch.attempts().iter().map(|a| a.id).collect();
        for id in ids {
            batch.set_result(
                id,
                ReconcileOutcome::Failed {
                    reason: Some("card_declined".to_string()),
                },
            );
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_overlapping_runs_settle_each_attempt_once() {
    let mut world = World::new();
    let attempt = world.stuck(&common::stripe(), 3, 0, false).await;
    let reconciler = Arc::new(GatedReconciler {
        gate: Barrier::new(2),
    });
    let first = world.orchestrator(InProcessEventBus::new().with_subscriber(reconciler.clone()));
    let second = world.orchestrator(InProcessEventBus::new().with_subscriber(reconciler));
    let request = request(&[(&common::stripe(), 2)], 100);

    let (a, b) = tokio::join!(first.run(&request), second.run(&request));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.examined() + b.examined(), 2);
    assert_eq!(a.reconciled() + b.reconciled(), 1);
    assert_eq!(a.unchanged() + b.unchanged(), 1);
    assert_eq!(a.errored() + b.errored(), 0);
    assert_eq!(world.status(&attempt).await, AttemptStatus::Failed);

    let recurring_id = world
        .ledger
        .contribution(attempt.contribution_id)
        .await
        .unwrap()
        .recurring_id
        .unwrap();
    assert_eq!(world.ledger.recurring(recurring_id).await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn test_missing_ledger_rows_error_per_attempt() {
    let mut world = World::new();
    let healthy = world.stuck(&common::stripe(), 3, 0, false).await;
    let since = world.clock.now() - Duration::days(3);

    // Contribution on file, schedule gone.
    let orphan_schedule = common::schedule(900, common::stripe());
    let orphan = common::contribution(900, &orphan_schedule, dec!(50.00), common::date(2026, 1, 1));
    world.ledger.insert_contribution(orphan.clone()).await;
    let no_schedule =
        common::stuck_attempt(world.store.as_ref(), &orphan, &common::stripe(), since).await;

    // Neither contribution nor schedule on file.
    let ghost_schedule = common::schedule(901, common::stripe());
    let ghost = common::contribution(901, &ghost_schedule, dec!(50.00), common::date(2026, 1, 1));
    let no_contribution =
        common::stuck_attempt(world.store.as_ref(), &ghost, &common::stripe(), since).await;

    let summary = run_single(&world, |_| {
        Some(ReconcileOutcome::Failed {
            reason: Some("card_declined".to_string()),
        })
    })
    .await;

    assert_eq!(summary.examined(), 3);
    assert_eq!(summary.reconciled(), 1);
    assert_eq!(summary.errored(), 2);
    assert_eq!(world.status(&healthy).await, AttemptStatus::Failed);
    assert_eq!(world.status(&no_schedule).await, AttemptStatus::Processing);
    assert_eq!(world.status(&no_contribution).await, AttemptStatus::Processing);
    assert_eq!(
        world.ledger.contribution(orphan.id).await.unwrap().status,
        ContributionStatus::Pending
    );
}

#[tokio::test]
async fn test_cancelling_unknown_contribution_errors_without_writes() {
    let mut world = World::new();
    let healthy = world.stuck(&common::stripe(), 3, 0, false).await;
    let ghost_schedule = common::schedule(902, common::stripe());
    let ghost = common::contribution(902, &ghost_schedule, dec!(50.00), common::date(2026, 1, 1));
    let unknown = common::stuck_attempt(
        world.store.as_ref(),
        &ghost,
        &common::stripe(),
        world.clock.now() - Duration::days(3),
    )
    .await;

    let summary = run_single(&world, |_| Some(ReconcileOutcome::Cancelled)).await;

    assert_eq!(summary.reconciled(), 1);
    assert_eq!(summary.errored(), 1);
    assert_eq!(world.status(&healthy).await, AttemptStatus::Cancelled);
    assert_eq!(world.status(&unknown).await, AttemptStatus::Processing);
}

#[tokio::test]
async fn test_completion_for_another_contribution_is_rejected() {
    let mut world = World::new();
    let attempt = world.stuck(&common::stripe(), 3, 0, false).await;
    let bystander = world.stuck(&common::stripe(), 3, 0, false).await;
    let (attempt_id, other) = (attempt.id, bystander.contribution_id);

    let summary = run_single(&world, move |a| {
        if a.id != attempt_id {
            return Some(ReconcileOutcome::Unchanged);
        }
        Some(ReconcileOutcome::Completed(Some(TransactionCompletion {
            contribution_id: other,
            trxn_id: "ch_wrong".to_string(),
            amount: dec!(50.00),
            fee_amount: None,
            trxn_date: common::date(2026, 1, 2),
        })))
    })
    .await;

    assert_eq!(summary.errored(), 1);
    assert_eq!(summary.unchanged(), 1);
    assert_eq!(world.status(&attempt).await, AttemptStatus::Processing);
    let untouched = world.ledger.contribution(other).await.unwrap();
    assert_eq!(untouched.status, ContributionStatus::Pending);
    assert_eq!(untouched.paid_amount, dec!(0));
}

/// Adds an attempt the threshold did not select, then settles it.
struct AdoptingReconciler {
    extra: PaymentAttempt,
}

#[async_trait]
impl EventSubscriber for AdoptingReconciler {
    async fn on_event(&self, event: &mut PaymentEvent) -> Result<()> {
        let PaymentEvent::ReconcileBatch(batch) = event else {
            return Ok(());
        };
        assert!(batch.attempts().is_empty());
        assert!(batch.push_attempt(self.extra.clone()));
        assert!(batch.set_result(self.extra.id, ReconcileOutcome::Completed(None)));
        Ok(())
    }
}

#[tokio::test]
async fn test_subscriber_added_attempt_is_reconciled() {
    let mut world = World::new();
    let recent = world.stuck(&common::stripe(), 1, 0, false).await;

    let summary = world
        .orchestrator(InProcessEventBus::new().with_subscriber(Arc::new(AdoptingReconciler {
            extra: recent.clone(),
        })))
        .run(&request(&[(&common::stripe(), 2)], 100))
        .await
        .unwrap();

    assert_eq!(summary.examined(), 1);
    assert_eq!(summary.reconciled(), 1);
    assert_eq!(world.status(&recent).await, AttemptStatus::Completed);
}
