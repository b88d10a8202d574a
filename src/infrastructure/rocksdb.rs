use crate::domain::attempt::{AttemptId, AttemptStatus, PaymentAttempt};
use crate::domain::ledger::ContributionId;
use crate::domain::ports::{
    AttemptStore, InsertOutcome, QueueItem, QueueTask, SharedClock, WebhookStore, WorkQueue,
};
use crate::domain::processor::ProcessorType;
use crate::domain::webhook::{PaymentWebhook, WebhookId, WebhookStatus};
use crate::error::{PaymentError, Result};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::in_memory::DEFAULT_LEASE_MINUTES;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for payment attempt rows.
pub const CF_ATTEMPTS: &str = "payment_attempts";
/// Column Family for payment webhook rows.
pub const CF_WEBHOOKS: &str = "payment_webhooks";
/// Column Family for queue items, keyed `queue/sequence` so a prefix scan is FIFO.
pub const CF_QUEUE: &str = "work_queue";
/// Unique index: contribution id -> attempt id.
pub const CF_ATTEMPTS_BY_CONTRIBUTION: &str = "attempts_by_contribution";
/// Unique index: `processor\0event_id` -> webhook id.
pub const CF_WEBHOOKS_BY_EVENT: &str = "webhooks_by_event";

const COLUMN_FAMILIES: [&str; 5] = [
    CF_ATTEMPTS,
    CF_WEBHOOKS,
    CF_QUEUE,
    CF_ATTEMPTS_BY_CONTRIBUTION,
    CF_WEBHOOKS_BY_EVENT,
];

/// A persistent store for attempts, webhooks and the work queue.
///
/// Each entity lives in its own Column Family; uniqueness constraints are
/// index families written in the same `WriteBatch` as the row. Every
/// read-modify-write runs under one store-wide mutex, so a compare-and-set
/// has exactly one winner among callers sharing this handle. RocksDB's own
/// lock file keeps other processes out of the directory.
///
/// `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    sequence: Arc<AtomicU64>,
    clock: SharedClock,
    lease: Duration,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path`, creating any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let store = Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            sequence: Arc::new(AtomicU64::new(1)),
            clock: Arc::new(SystemClock),
            lease: Duration::minutes(DEFAULT_LEASE_MINUTES),
        };
        let next = store.last_queue_sequence()? + 1;
        store.sequence.store(next, Ordering::SeqCst);
        Ok(store)
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::StorageError(format!("{name} column family not found")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn get_index(&self, cf_name: &str, key: &[u8]) -> Result<Option<Uuid>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(cf, key)?
            .map(|bytes| {
                Uuid::from_slice(&bytes)
                    .map_err(|e| PaymentError::StorageError(format!("Corrupt index entry: {e}")))
            })
            .transpose()
    }

    /// Every row of a column family, deserialized.
    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|item| -> Result<T> {
                let (_key, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    /// `(key, item)` pairs of one queue in FIFO order.
    fn scan_queue(&self, queue: &ProcessorType) -> Result<Vec<(Box<[u8]>, QueueItem)>> {
        let cf = self.cf(CF_QUEUE)?;
        let prefix = queue_prefix(queue);
        let mut items = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            items.push((key, serde_json::from_slice(&value)?));
        }
        Ok(items)
    }

    fn last_queue_sequence(&self) -> Result<u64> {
        let cf = self.cf(CF_QUEUE)?;
        let mut last = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _value) = item?;
            let seq = key
                .rsplit(|b| *b == b'/')
                .next()
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            last = last.max(seq);
        }
        Ok(last)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn update_attempt<F>(&self, id: AttemptId, apply: F) -> Result<PaymentAttempt>
    where
        F: FnOnce(&mut PaymentAttempt),
    {
        let mut attempt: PaymentAttempt = self
            .get_json(CF_ATTEMPTS, id.as_bytes())?
            .ok_or_else(|| PaymentError::not_found("payment attempt", id))?;
        apply(&mut attempt);
        self.put_json(CF_ATTEMPTS, id.as_bytes(), &attempt)?;
        Ok(attempt)
    }
}

fn queue_prefix(queue: &ProcessorType) -> Vec<u8> {
    format!("{queue}/").into_bytes()
}

fn queue_key(queue: &ProcessorType, seq: u64) -> Vec<u8> {
    format!("{queue}/{seq:020}").into_bytes()
}

fn event_key(processor_type: &ProcessorType, event_id: &str) -> Vec<u8> {
    let mut key = processor_type.as_str().as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(event_id.as_bytes());
    key
}

#[async_trait]
impl AttemptStore for RocksDBStore {
    async fn insert(&self, attempt: PaymentAttempt) -> Result<InsertOutcome<PaymentAttempt>> {
        let _guard = self.write_lock.lock().await;
        let index_key = attempt.contribution_id.to_be_bytes();
        if let Some(existing_id) = self.get_index(CF_ATTEMPTS_BY_CONTRIBUTION, &index_key)? {
            let existing: PaymentAttempt = self
                .get_json(CF_ATTEMPTS, existing_id.as_bytes())?
                .ok_or_else(|| PaymentError::not_found("payment attempt", existing_id))?;
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_ATTEMPTS)?,
            attempt.id.as_bytes(),
            serde_json::to_vec(&attempt)?,
        );
        batch.put_cf(
            self.cf(CF_ATTEMPTS_BY_CONTRIBUTION)?,
            index_key,
            attempt.id.as_bytes(),
        );
        self.db.write(batch)?;
        Ok(InsertOutcome::Inserted(attempt))
    }

    async fn get(&self, id: AttemptId) -> Result<Option<PaymentAttempt>> {
        self.get_json(CF_ATTEMPTS, id.as_bytes())
    }

    async fn find_by_contribution(
        &self,
        contribution_id: ContributionId,
    ) -> Result<Option<PaymentAttempt>> {
        match self.get_index(CF_ATTEMPTS_BY_CONTRIBUTION, &contribution_id.to_be_bytes())? {
            Some(id) => self.get_json(CF_ATTEMPTS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn find_by_contributions(
        &self,
        contribution_ids: &[ContributionId],
    ) -> Result<HashMap<ContributionId, PaymentAttempt>> {
        let mut found = HashMap::new();
        for cid in contribution_ids {
            if let Some(attempt) = self.find_by_contribution(*cid).await? {
                found.insert(*cid, attempt);
            }
        }
        Ok(found)
    }

    async fn compare_and_set_status(
        &self,
        id: AttemptId,
        expected: AttemptStatus,
        new: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut attempt) = self.get_json::<PaymentAttempt>(CF_ATTEMPTS, id.as_bytes())? else {
            return Ok(false);
        };
        if attempt.status != expected {
            return Ok(false);
        }
        attempt.status = new;
        attempt.updated_date = now;
        self.put_json(CF_ATTEMPTS, id.as_bytes(), &attempt)?;
        Ok(true)
    }

    async fn set_status(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.update_attempt(id, |attempt| {
            attempt.status = status;
            attempt.updated_date = now;
        })?;
        Ok(())
    }

    async fn set_processor_refs(
        &self,
        id: AttemptId,
        session_id: Option<String>,
        payment_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.update_attempt(id, |attempt| {
            if session_id.is_some() {
                attempt.processor_session_id = session_id;
            }
            if payment_id.is_some() {
                attempt.processor_payment_id = payment_id;
            }
            attempt.updated_date = now;
        })?;
        Ok(())
    }

    async fn find_stuck(
        &self,
        processor_type: &ProcessorType,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentAttempt>> {
        let mut stuck: Vec<PaymentAttempt> = self
            .scan::<PaymentAttempt>(CF_ATTEMPTS)?
            .into_iter()
            .filter(|a| {
                a.status == AttemptStatus::Processing
                    && &a.processor_type == processor_type
                    && a.updated_date < cutoff
            })
            .collect();
        stuck.sort_by_key(|a| (a.updated_date, a.contribution_id));
        stuck.truncate(limit);
        Ok(stuck)
    }
}

#[async_trait]
impl WebhookStore for RocksDBStore {
    async fn insert(&self, webhook: PaymentWebhook) -> Result<InsertOutcome<PaymentWebhook>> {
        let _guard = self.write_lock.lock().await;
        let index_key = event_key(&webhook.processor_type, &webhook.event_id);
        if let Some(existing_id) = self.get_index(CF_WEBHOOKS_BY_EVENT, &index_key)? {
            let existing: PaymentWebhook = self
                .get_json(CF_WEBHOOKS, existing_id.as_bytes())?
                .ok_or_else(|| PaymentError::not_found("payment webhook", existing_id))?;
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_WEBHOOKS)?,
            webhook.id.as_bytes(),
            serde_json::to_vec(&webhook)?,
        );
        batch.put_cf(self.cf(CF_WEBHOOKS_BY_EVENT)?, index_key, webhook.id.as_bytes());
        self.db.write(batch)?;
        Ok(InsertOutcome::Inserted(webhook))
    }

    async fn get(&self, id: WebhookId) -> Result<Option<PaymentWebhook>> {
        self.get_json(CF_WEBHOOKS, id.as_bytes())
    }

    async fn find_by_event(
        &self,
        event_id: &str,
        processor_type: &ProcessorType,
    ) -> Result<Option<PaymentWebhook>> {
        match self.get_index(CF_WEBHOOKS_BY_EVENT, &event_key(processor_type, event_id))? {
            Some(id) => self.get_json(CF_WEBHOOKS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn compare_and_set_status(
        &self,
        id: WebhookId,
        expected: WebhookStatus,
        new: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut webhook) = self.get_json::<PaymentWebhook>(CF_WEBHOOKS, id.as_bytes())? else {
            return Ok(false);
        };
        if webhook.status != expected {
            return Ok(false);
        }
        webhook.status = new;
        match new {
            WebhookStatus::Processing => webhook.processing_started_at = Some(now),
            WebhookStatus::New => webhook.processing_started_at = None,
            _ => {}
        }
        self.put_json(CF_WEBHOOKS, id.as_bytes(), &webhook)?;
        Ok(true)
    }

    async fn update(&self, webhook: PaymentWebhook) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = webhook.id.as_bytes().to_vec();
        let cf = self.cf(CF_WEBHOOKS)?;
        if self.db.get_pinned_cf(cf, &key)?.is_none() {
            return Err(PaymentError::not_found("payment webhook", webhook.id));
        }
        self.put_json(CF_WEBHOOKS, &key, &webhook)
    }

    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentWebhook>> {
        let mut stuck: Vec<PaymentWebhook> = self
            .scan::<PaymentWebhook>(CF_WEBHOOKS)?
            .into_iter()
            .filter(|w| {
                w.status == WebhookStatus::Processing
                    && w.processing_started_at.is_some_and(|started| started < cutoff)
            })
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
        let mut due: Vec<PaymentWebhook> = self
            .scan::<PaymentWebhook>(CF_WEBHOOKS)?
            .into_iter()
            .filter(|w| {
                w.status == WebhookStatus::Error
                    && &w.processor_type == processor_type
                    && w.next_retry_at.is_some_and(|at| at <= now)
            })
            .collect();
        due.sort_by_key(|w| w.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }
}

#[async_trait]
impl WorkQueue for RocksDBStore {
    async fn create(&self, queue: &ProcessorType, task: QueueTask) -> Result<QueueItem> {
        let _guard = self.write_lock.lock().await;
        let seq = self.next_sequence();
        let item = QueueItem {
            id: format!("{queue}-{seq:012}"),
            queue: queue.clone(),
            task,
            leased_until: None,
        };
        self.put_json(CF_QUEUE, &queue_key(queue, seq), &item)?;
        Ok(item)
    }

    async fn claim(&self, queue: &ProcessorType) -> Result<Option<QueueItem>> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let claimable = self
            .scan_queue(queue)?
            .into_iter()
            .find(|(_, item)| item.leased_until.is_none_or(|until| until <= now));
        let Some((key, mut item)) = claimable else {
            return Ok(None);
        };
        item.leased_until = Some(now + self.lease);
        self.put_json(CF_QUEUE, &key, &item)?;
        Ok(Some(item))
    }

    async fn release(&self, item: &QueueItem) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let Some((key, mut stored)) = self
            .scan_queue(&item.queue)?
            .into_iter()
            .find(|(_, stored)| stored.id == item.id)
        else {
            return Ok(());
        };
        stored.leased_until = None;
        let cf = self.cf(CF_QUEUE)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, key);
        batch.put_cf(
            cf,
            queue_key(&item.queue, self.next_sequence()),
            serde_json::to_vec(&stored)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn delete(&self, item: &QueueItem) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some((key, _)) = self
            .scan_queue(&item.queue)?
            .into_iter()
            .find(|(_, stored)| stored.id == item.id)
        {
            self.db.delete_cf(self.cf(CF_QUEUE)?, key)?;
        }
        Ok(())
    }

    async fn count(&self, queue: &ProcessorType) -> Result<usize> {
        Ok(self.scan_queue(queue)?.len())
    }

    async fn queue_names(&self) -> Result<Vec<ProcessorType>> {
        let names: BTreeSet<ProcessorType> = self
            .scan::<QueueItem>(CF_QUEUE)?
            .into_iter()
            .map(|item| item.queue)
            .collect();
        Ok(names.into_iter().collect())
    }
}
