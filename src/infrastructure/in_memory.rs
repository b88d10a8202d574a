use crate::domain::attempt::{AttemptId, AttemptStatus, PaymentAttempt};
use crate::domain::ledger::{
    Contribution, ContributionId, ContributionStatus, RecurringContribution, RecurringId,
    RecurringStatus, TransactionCompletion,
};
use crate::domain::ports::{
    AttemptStore, ChargeCriteria, Clock, InsertOutcome, Ledger, QueueItem, QueueTask,
    SharedClock, WebhookStore, WorkQueue,
};
use crate::domain::processor::ProcessorType;
use crate::domain::webhook::{PaymentWebhook, WebhookId, WebhookStatus};
use crate::error::{PaymentError, Result};
use crate::infrastructure::clock::SystemClock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct AttemptTable {
    rows: HashMap<AttemptId, PaymentAttempt>,
    by_contribution: HashMap<ContributionId, AttemptId>,
}

/// A thread-safe in-memory payment attempt ledger.
///
/// The contribution index plays the role of the unique constraint; every
/// conditional update runs inside a single write-lock section.
#[derive(Default, Clone)]
pub struct InMemoryAttemptStore {
    table: Arc<RwLock<AttemptTable>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn insert(&self, attempt: PaymentAttempt) -> Result<InsertOutcome<PaymentAttempt>> {
        let mut table = self.table.write().await;
        if let Some(existing) = table
            .by_contribution
            .get(&attempt.contribution_id)
            .and_then(|id| table.rows.get(id))
        {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        table
            .by_contribution
            .insert(attempt.contribution_id, attempt.id);
        table.rows.insert(attempt.id, attempt.clone());
        Ok(InsertOutcome::Inserted(attempt))
    }

    async fn get(&self, id: AttemptId) -> Result<Option<PaymentAttempt>> {
        let table = self.table.read().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn find_by_contribution(
        &self,
        contribution_id: ContributionId,
    ) -> Result<Option<PaymentAttempt>> {
        let table = self.table.read().await;
        Ok(table
            .by_contribution
            .get(&contribution_id)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn find_by_contributions(
        &self,
        contribution_ids: &[ContributionId],
    ) -> Result<HashMap<ContributionId, PaymentAttempt>> {
        let table = self.table.read().await;
        Ok(contribution_ids
            .iter()
            .filter_map(|cid| {
                table
                    .by_contribution
                    .get(cid)
                    .and_then(|id| table.rows.get(id))
                    .map(|attempt| (*cid, attempt.clone()))
            })
            .collect())
    }

    async fn compare_and_set_status(
        &self,
        id: AttemptId,
        expected: AttemptStatus,
        new: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut table = self.table.write().await;
        match table.rows.get_mut(&id) {
            Some(attempt) if attempt.status == expected => {
                attempt.status = new;
                attempt.updated_date = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut table = self.table.write().await;
        let attempt = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| PaymentError::not_found("payment attempt", id))?;
        attempt.status = status;
        attempt.updated_date = now;
        Ok(())
    }

    async fn set_processor_refs(
        &self,
        id: AttemptId,
        session_id: Option<String>,
        payment_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut table = self.table.write().await;
        let attempt = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| PaymentError::not_found("payment attempt", id))?;
        if session_id.is_some() {
            attempt.processor_session_id = session_id;
        }
        if payment_id.is_some() {
            attempt.processor_payment_id = payment_id;
        }
        attempt.updated_date = now;
        Ok(())
    }

    async fn find_stuck(
        &self,
        processor_type: &ProcessorType,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentAttempt>> {
        let table = self.table.read().await;
        let mut stuck: Vec<PaymentAttempt> = table
            .rows
            .values()
            .filter(|a| {
                a.status == AttemptStatus::Processing
                    && &a.processor_type == processor_type
                    && a.updated_date < cutoff
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|a| (a.updated_date, a.contribution_id));
        stuck.truncate(limit);
        Ok(stuck)
    }
}

#[derive(Default)]
struct WebhookTable {
    rows: HashMap<WebhookId, PaymentWebhook>,
    by_event: HashMap<(ProcessorType, String), WebhookId>,
}

/// A thread-safe in-memory webhook log keyed uniquely by `(processor_type, event_id)`.
#[derive(Default, Clone)]
pub struct InMemoryWebhookStore {
    table: Arc<RwLock<WebhookTable>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn insert(&self, webhook: PaymentWebhook) -> Result<InsertOutcome<PaymentWebhook>> {
        let mut table = self.table.write().await;
        let key = (webhook.processor_type.clone(), webhook.event_id.clone());
        if let Some(existing) = table.by_event.get(&key).and_then(|id| table.rows.get(id)) {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        table.by_event.insert(key, webhook.id);
        table.rows.insert(webhook.id, webhook.clone());
        Ok(InsertOutcome::Inserted(webhook))
    }

    async fn get(&self, id: WebhookId) -> Result<Option<PaymentWebhook>> {
        let table = self.table.read().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn find_by_event(
        &self,
        event_id: &str,
        processor_type: &ProcessorType,
    ) -> Result<Option<PaymentWebhook>> {
        let table = self.table.read().await;
        Ok(table
            .by_event
            .get(&(processor_type.clone(), event_id.to_string()))
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn compare_and_set_status(
        &self,
        id: WebhookId,
        expected: WebhookStatus,
        new: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut table = self.table.write().await;
        match table.rows.get_mut(&id) {
            Some(webhook) if webhook.status == expected => {
                webhook.status = new;
                match new {
                    WebhookStatus::Processing => webhook.processing_started_at = Some(now),
                    WebhookStatus::New => webhook.processing_started_at = None,
                    _ => {}
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, webhook: PaymentWebhook) -> Result<()> {
        let mut table = self.table.write().await;
        match table.rows.get_mut(&webhook.id) {
            Some(row) => {
                *row = webhook;
                Ok(())
            }
            None => Err(PaymentError::not_found("payment webhook", webhook.id)),
        }
    }

    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentWebhook>> {
        let table = self.table.read().await;
        let mut stuck: Vec<PaymentWebhook> = table
            .rows
            .values()
            .filter(|w| {
                w.status == WebhookStatus::Processing
                    && w.processing_started_at.is_some_and(|started| started < cutoff)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|w| w.processing_started_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn find_due_retries(
        &self,
        processor_type: &ProcessorType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentWebhook>> {
        let table = self.table.read().await;
        let mut due: Vec<PaymentWebhook> = table
            .rows
            .values()
            .filter(|w| {
                w.status == WebhookStatus::Error
                    && &w.processor_type == processor_type
                    && w.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|w| w.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }
}

/// Default lease on a claimed queue item, in minutes.
pub const DEFAULT_LEASE_MINUTES: i64 = 10;

/// A lease-based in-memory work queue with one FIFO per processor type.
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    queues: Arc<RwLock<HashMap<ProcessorType, VecDeque<QueueItem>>>>,
    sequence: Arc<AtomicU64>,
    clock: SharedClock,
    lease: Duration,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(1)),
            clock,
            lease: Duration::minutes(DEFAULT_LEASE_MINUTES),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn create(&self, queue: &ProcessorType, task: QueueTask) -> Result<QueueItem> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem {
            id: format!("{queue}-{seq:012}"),
            queue: queue.clone(),
            task,
            leased_until: None,
        };
        let mut queues = self.queues.write().await;
        queues
            .entry(queue.clone())
            .or_default()
            .push_back(item.clone());
        Ok(item)
    }

    async fn claim(&self, queue: &ProcessorType) -> Result<Option<QueueItem>> {
        let now = self.clock.now();
        let mut queues = self.queues.write().await;
        let Some(items) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let claimable = items
            .iter_mut()
            .find(|item| item.leased_until.is_none_or(|until| until <= now));
        Ok(claimable.map(|item| {
            item.leased_until = Some(now + self.lease);
            item.clone()
        }))
    }

    async fn release(&self, item: &QueueItem) -> Result<()> {
        let mut queues = self.queues.write().await;
        if let Some(items) = queues.get_mut(&item.queue)
            && let Some(pos) = items.iter().position(|i| i.id == item.id)
            && let Some(mut released) = items.remove(pos)
        {
            released.leased_until = None;
            items.push_back(released);
        }
        Ok(())
    }

    async fn delete(&self, item: &QueueItem) -> Result<()> {
        let mut queues = self.queues.write().await;
        if let Some(items) = queues.get_mut(&item.queue) {
            items.retain(|i| i.id != item.id);
        }
        Ok(())
    }

    async fn count(&self, queue: &ProcessorType) -> Result<usize> {
        let queues = self.queues.read().await;
        Ok(queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn queue_names(&self) -> Result<Vec<ProcessorType>> {
        let queues = self.queues.read().await;
        let mut names: Vec<ProcessorType> = queues.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Serialized form of the in-memory ledger, used for `--ledger` snapshots.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub contributions: Vec<Contribution>,
    #[serde(default)]
    pub recurring: Vec<RecurringContribution>,
}

#[derive(Default)]
struct LedgerTables {
    contributions: BTreeMap<ContributionId, Contribution>,
    recurring: BTreeMap<RecurringId, RecurringContribution>,
}

/// In-memory stand-in for the external accounting ledger.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    tables: Arc<RwLock<LedgerTables>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let tables = LedgerTables {
            contributions: snapshot
                .contributions
                .into_iter()
                .map(|c| (c.id, c))
                .collect(),
            recurring: snapshot.recurring.into_iter().map(|r| (r.id, r)).collect(),
        };
        Self {
            tables: Arc::new(RwLock::new(tables)),
        }
    }

    /// Loads a JSON snapshot; a missing file yields an empty ledger.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => Ok(Self::from_snapshot(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let tables = self.tables.read().await;
        LedgerSnapshot {
            contributions: tables.contributions.values().cloned().collect(),
            recurring: tables.recurring.values().cloned().collect(),
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = self.snapshot().await;
        let json = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub async fn insert_contribution(&self, contribution: Contribution) {
        let mut tables = self.tables.write().await;
        tables.contributions.insert(contribution.id, contribution);
    }

    pub async fn insert_recurring(&self, recurring: RecurringContribution) {
        let mut tables = self.tables.write().await;
        tables.recurring.insert(recurring.id, recurring);
    }

    pub async fn contribution(&self, id: ContributionId) -> Option<Contribution> {
        self.tables.read().await.contributions.get(&id).cloned()
    }

    pub async fn recurring(&self, id: RecurringId) -> Option<RecurringContribution> {
        self.tables.read().await.recurring.get(&id).cloned()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn get_contributions(
        &self,
        ids: &[ContributionId],
    ) -> Result<HashMap<ContributionId, Contribution>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.contributions.get(id).map(|c| (*id, c.clone())))
            .collect())
    }

    async fn get_recurring(
        &self,
        ids: &[RecurringId],
    ) -> Result<HashMap<RecurringId, RecurringContribution>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.recurring.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn find_chargeable(
        &self,
        criteria: &ChargeCriteria,
        after: Option<ContributionId>,
        limit: usize,
    ) -> Result<Vec<Contribution>> {
        let tables = self.tables.read().await;
        let start = after.map_or(0, |id| id.saturating_add(1));
        Ok(tables
            .contributions
            .range(start..)
            .map(|(_, c)| c)
            .filter(|c| {
                c.is_open()
                    && c.outstanding() > rust_decimal::Decimal::ZERO
                    && c.receive_date <= criteria.as_of
            })
            .filter(|c| {
                c.recurring_id
                    .and_then(|rid| tables.recurring.get(&rid))
                    .is_some_and(|r| {
                        r.is_active()
                            && r.processor_type == criteria.processor_type
                            && r.has_payment_method()
                            && r.failure_count <= criteria.max_failure_count
                    })
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn complete_contribution(&self, completion: &TransactionCompletion) -> Result<()> {
        let mut tables = self.tables.write().await;
        let contribution = tables
            .contributions
            .get_mut(&completion.contribution_id)
            .ok_or_else(|| PaymentError::not_found("contribution", completion.contribution_id))?;
        contribution.paid_amount += completion.amount;
        contribution.status = if contribution.paid_amount >= contribution.total_amount {
            ContributionStatus::Completed
        } else {
            ContributionStatus::PartiallyPaid
        };
        contribution.is_pay_later = false;
        let recurring_id = contribution.recurring_id;
        if let Some(schedule) = recurring_id.and_then(|id| tables.recurring.get_mut(&id))
            && schedule.status == RecurringStatus::Pending
        {
            schedule.status = RecurringStatus::InProgress;
        }
        Ok(())
    }

    async fn mark_contribution_failed(&self, id: ContributionId, _reason: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let contribution = tables
            .contributions
            .get_mut(&id)
            .ok_or_else(|| PaymentError::not_found("contribution", id))?;
        contribution.status = ContributionStatus::Failed;
        Ok(())
    }

    async fn increment_failure_count(&self, id: RecurringId) -> Result<u32> {
        let mut tables = self.tables.write().await;
        let schedule = tables
            .recurring
            .get_mut(&id)
            .ok_or_else(|| PaymentError::not_found("recurring contribution", id))?;
        schedule.failure_count += 1;
        Ok(schedule.failure_count)
    }

    async fn find_due_schedules(
        &self,
        processor_type: &ProcessorType,
        as_of: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RecurringContribution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .recurring
            .values()
            .filter(|r| {
                r.is_active()
                    && &r.processor_type == processor_type
                    && r.next_sched_date.is_some_and(|d| d <= as_of)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_instalment(
        &self,
        recurring_id: RecurringId,
        receive_date: NaiveDate,
    ) -> Result<Option<Contribution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .contributions
            .values()
            .find(|c| c.recurring_id == Some(recurring_id) && c.receive_date == receive_date)
            .cloned())
    }

    async fn count_instalments(&self, recurring_id: RecurringId) -> Result<u32> {
        let tables = self.tables.read().await;
        let count = tables
            .contributions
            .values()
            .filter(|c| c.recurring_id == Some(recurring_id))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn create_instalment(
        &self,
        schedule: &RecurringContribution,
        receive_date: NaiveDate,
    ) -> Result<Contribution> {
        let mut tables = self.tables.write().await;
        let id = tables
            .contributions
            .keys()
            .next_back()
            .map_or(1, |last| last + 1);
        let contribution = Contribution {
            id,
            contact_id: schedule.contact_id,
            recurring_id: Some(schedule.id),
            processor_type: Some(schedule.processor_type.clone()),
            status: ContributionStatus::Pending,
            total_amount: schedule.amount,
            paid_amount: rust_decimal::Decimal::ZERO,
            currency: schedule.currency.clone(),
            receive_date,
            is_pay_later: false,
        };
        tables.contributions.insert(id, contribution.clone());
        Ok(contribution)
    }

    async fn advance_schedule(
        &self,
        id: RecurringId,
        next_sched_date: Option<NaiveDate>,
        completed: bool,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let schedule = tables
            .recurring
            .get_mut(&id)
            .ok_or_else(|| PaymentError::not_found("recurring contribution", id))?;
        schedule.next_sched_date = next_sched_date;
        if completed {
            schedule.status = RecurringStatus::Completed;
        }
        Ok(())
    }
}
