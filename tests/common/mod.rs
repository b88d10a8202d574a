#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use paycycle::domain::attempt::{AttemptStatus, PaymentAttempt};
use paycycle::domain::events::{ChargeBatchEvent, PaymentEvent, ReconcileOutcome};
use paycycle::domain::ledger::{
    Contribution, ContributionId, ContributionStatus, FrequencyUnit, RecurringContribution,
    RecurringId, RecurringStatus,
};
use paycycle::domain::ports::AttemptStore;
use paycycle::domain::processor::ProcessorType;
use paycycle::error::Result;
use paycycle::infrastructure::event_bus::EventSubscriber;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub fn processor(name: &str) -> ProcessorType {
    ProcessorType::new(name).unwrap()
}

pub fn stripe() -> ProcessorType {
    processor("stripe")
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn schedule(id: RecurringId, processor_type: ProcessorType) -> RecurringContribution {
    RecurringContribution {
        id,
        contact_id: 100 + id,
        payment_processor_id: 1,
        processor_type,
        status: RecurringStatus::InProgress,
        payment_token: Some(format!("pm_{id}")),
        failure_count: 0,
        amount: Decimal::new(5000, 2),
        currency: "GBP".to_string(),
        frequency_unit: FrequencyUnit::Month,
        frequency_interval: 1,
        next_sched_date: None,
        installments: None,
    }
}

pub fn contribution(
    id: ContributionId,
    schedule: &RecurringContribution,
    total: Decimal,
    receive_date: NaiveDate,
) -> Contribution {
    Contribution {
        id,
        contact_id: schedule.contact_id,
        recurring_id: Some(schedule.id),
        processor_type: Some(schedule.processor_type.clone()),
        status: ContributionStatus::Pending,
        total_amount: total,
        paid_amount: Decimal::ZERO,
        currency: schedule.currency.clone(),
        receive_date,
        is_pay_later: false,
    }
}

/// Inserts an attempt for `contribution` and leaves it in `processing`,
/// last touched at `since`.
pub async fn stuck_attempt(
    store: &dyn AttemptStore,
    contribution: &Contribution,
    processor_type: &ProcessorType,
    since: DateTime<Utc>,
) -> PaymentAttempt {
    let attempt = PaymentAttempt::pending(
        contribution.id,
        contribution.contact_id,
        1,
        processor_type.clone(),
        since,
    );
    let attempt = store.insert(attempt).await.unwrap().into_inner();
    assert!(
        store
            .compare_and_set_status(
                attempt.id,
                AttemptStatus::Pending,
                AttemptStatus::Processing,
                since
            )
            .await
            .unwrap()
    );
    store.get(attempt.id).await.unwrap().unwrap()
}

type Script = dyn Fn(&PaymentAttempt) -> Option<ReconcileOutcome> + Send + Sync;

/// Answers reconcile batches of one processor from a script.
pub struct ScriptedReconciler {
    processor_type: ProcessorType,
    script: Box<Script>,
    seen: Mutex<Vec<usize>>,
}

impl ScriptedReconciler {
    pub fn new<F>(processor_type: ProcessorType, script: F) -> Arc<Self>
    where
        F: Fn(&PaymentAttempt) -> Option<ReconcileOutcome> + Send + Sync + 'static,
    {
        Arc::new(Self {
            processor_type,
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Batch sizes this reconciler was handed, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSubscriber for ScriptedReconciler {
    async fn on_event(&self, event: &mut PaymentEvent) -> Result<()> {
        let PaymentEvent::ReconcileBatch(batch) = event else {
            return Ok(());
        };
        if batch.processor_type != self.processor_type {
            return Ok(());
        }
        self.seen.lock().unwrap().push(batch.attempts().len());
        let answers: Vec<_> = batch
            .attempts()
            .iter()
            .filter_map(|attempt| (self.script)(attempt).map(|outcome| (attempt.id, outcome)))
            .collect();
        for (id, outcome) in answers {
            batch.set_result(id, outcome);
        }
        Ok(())
    }
}

/// Keeps every charge batch it sees.
#[derive(Default)]
pub struct ChargeRecorder {
    batches: Mutex<Vec<ChargeBatchEvent>>,
}

impl ChargeRecorder {
    pub fn batches(&self) -> Vec<ChargeBatchEvent> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSubscriber for ChargeRecorder {
    async fn on_event(&self, event: &mut PaymentEvent) -> Result<()> {
        if let PaymentEvent::ChargeBatch(batch) = event {
            self.batches.lock().unwrap().push(batch.clone());
        }
        Ok(())
    }
}

pub fn generate_webhook_csv(
    path: &Path,
    rows: usize,
    processor: &str,
) -> std::result::Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record([
        "event_id",
        "processor_type",
        "event_type",
        "payment_attempt_id",
        "payload",
    ])?;

    for i in 1..=rows {
        let event_id = format!("evt_{i}");
        let payload = format!("{{\"seq\": {i}}}");
        wtr.write_record([
            event_id.as_str(),
            processor,
            "invoice.paid",
            "",
            payload.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
