use super::attempt::{AttemptId, AttemptStatus, PaymentAttempt};
use super::events::PaymentEvent;
use super::ledger::{
    Contribution, ContributionId, RecurringContribution, RecurringId, TransactionCompletion,
};
use super::processor::ProcessorType;
use super::webhook::{PaymentWebhook, WebhookId, WebhookStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// A row with the same unique key already exists; carries that row.
    Duplicate(T),
}

impl<T> InsertOutcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(value) | InsertOutcome::Duplicate(value) => value,
        }
    }
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Inserts unless an attempt already exists for the same contribution.
    async fn insert(&self, attempt: PaymentAttempt) -> Result<InsertOutcome<PaymentAttempt>>;
    async fn get(&self, id: AttemptId) -> Result<Option<PaymentAttempt>>;
    async fn find_by_contribution(
        &self,
        contribution_id: ContributionId,
    ) -> Result<Option<PaymentAttempt>>;
    async fn find_by_contributions(
        &self,
        contribution_ids: &[ContributionId],
    ) -> Result<HashMap<ContributionId, PaymentAttempt>>;
    /// Sets `new` only if the stored status is `expected`. Exactly one of any
    /// set of concurrent callers with the same `expected` observes `true`.
    async fn compare_and_set_status(
        &self,
        id: AttemptId,
        expected: AttemptStatus,
        new: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Unconditional status write for single-writer contexts.
    async fn set_status(&self, id: AttemptId, status: AttemptStatus, now: DateTime<Utc>)
    -> Result<()>;
    async fn set_processor_refs(
        &self,
        id: AttemptId,
        session_id: Option<String>,
        payment_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    /// `processing` attempts of one processor last touched before `cutoff`, oldest first.
    async fn find_stuck(
        &self,
        processor_type: &ProcessorType,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentAttempt>>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Inserts unless `(event_id, processor_type)` is already logged.
    async fn insert(&self, webhook: PaymentWebhook) -> Result<InsertOutcome<PaymentWebhook>>;
    async fn get(&self, id: WebhookId) -> Result<Option<PaymentWebhook>>;
    async fn find_by_event(
        &self,
        event_id: &str,
        processor_type: &ProcessorType,
    ) -> Result<Option<PaymentWebhook>>;
    /// Conditional status move; entering `processing` stamps `processing_started_at`.
    async fn compare_and_set_status(
        &self,
        id: WebhookId,
        expected: WebhookStatus,
        new: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Full row write. Only the worker holding the `processing` claim calls this.
    async fn update(&self, webhook: PaymentWebhook) -> Result<()>;
    /// `processing` rows whose claim started before `cutoff`, oldest first.
    async fn find_stuck(&self, cutoff: DateTime<Utc>, limit: usize)
    -> Result<Vec<PaymentWebhook>>;
    /// `error` rows of one processor whose `next_retry_at` is at or before `now`.
    async fn find_due_retries(
        &self,
        processor_type: &ProcessorType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentWebhook>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTask {
    pub webhook_id: WebhookId,
}

/// A claimed or stored item of a logical queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub queue: ProcessorType,
    pub task: QueueTask,
    pub leased_until: Option<DateTime<Utc>>,
}

/// Durable work queue, one logical queue per processor type.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn create(&self, queue: &ProcessorType, task: QueueTask) -> Result<QueueItem>;
    /// Leases the oldest claimable item, if any.
    async fn claim(&self, queue: &ProcessorType) -> Result<Option<QueueItem>>;
    /// Drops the lease and puts the item back for a later claim.
    async fn release(&self, item: &QueueItem) -> Result<()>;
    async fn delete(&self, item: &QueueItem) -> Result<()>;
    async fn count(&self, queue: &ProcessorType) -> Result<usize>;
    async fn queue_names(&self) -> Result<Vec<ProcessorType>>;
}

/// Selection for the instalment charge run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeCriteria {
    pub processor_type: ProcessorType,
    pub as_of: NaiveDate,
    pub max_failure_count: u32,
}

/// Narrow interface to the external accounting ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_contributions(
        &self,
        ids: &[ContributionId],
    ) -> Result<HashMap<ContributionId, Contribution>>;
    async fn get_recurring(
        &self,
        ids: &[RecurringId],
    ) -> Result<HashMap<RecurringId, RecurringContribution>>;
    /// Open, due contributions with outstanding balance on an active schedule of
    /// `processor_type` with a stored payment method and an acceptable failure
    /// count. Ordered by id, starting after `after`.
    async fn find_chargeable(
        &self,
        criteria: &ChargeCriteria,
        after: Option<ContributionId>,
        limit: usize,
    ) -> Result<Vec<Contribution>>;
    async fn complete_contribution(&self, completion: &TransactionCompletion) -> Result<()>;
    async fn mark_contribution_failed(&self, id: ContributionId, reason: &str) -> Result<()>;
    /// Returns the new failure count.
    async fn increment_failure_count(&self, id: RecurringId) -> Result<u32>;
    /// Active schedules of `processor_type` with `next_sched_date <= as_of`.
    async fn find_due_schedules(
        &self,
        processor_type: &ProcessorType,
        as_of: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RecurringContribution>>;
    async fn find_instalment(
        &self,
        recurring_id: RecurringId,
        receive_date: NaiveDate,
    ) -> Result<Option<Contribution>>;
    async fn count_instalments(&self, recurring_id: RecurringId) -> Result<u32>;
    async fn create_instalment(
        &self,
        schedule: &RecurringContribution,
        receive_date: NaiveDate,
    ) -> Result<Contribution>;
    async fn advance_schedule(
        &self,
        id: RecurringId,
        next_sched_date: Option<NaiveDate>,
        completed: bool,
    ) -> Result<()>;
}

/// Synchronous in-process publish/subscribe. Subscribers may write results
/// into the event before `publish` returns.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &mut PaymentEvent) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedAttemptStore = Arc<dyn AttemptStore>;
pub type SharedWebhookStore = Arc<dyn WebhookStore>;
pub type SharedWorkQueue = Arc<dyn WorkQueue>;
pub type SharedLedger = Arc<dyn Ledger>;
pub type SharedEventBus = Arc<dyn EventBus>;
pub type SharedClock = Arc<dyn Clock>;
