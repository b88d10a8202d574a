use super::context::RunContext;
use crate::domain::ports::{InsertOutcome, SharedWebhookStore};
use crate::domain::processor::ProcessorType;
use crate::domain::webhook::{PaymentWebhook, ResultCode, RetryPolicy, WebhookStatus};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// Dedup, claim and retry bookkeeping over the payment webhook log.
#[derive(Clone)]
pub struct WebhookLog {
    store: SharedWebhookStore,
    ctx: RunContext,
    retry: RetryPolicy,
}

impl WebhookLog {
    pub fn new(store: SharedWebhookStore, ctx: RunContext, retry: RetryPolicy) -> Self {
        Self { store, ctx, retry }
    }

    pub fn store(&self) -> &SharedWebhookStore {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.ctx.now()
    }

    /// Logs a new event unless `(event_id, processor_type)` is already known.
    pub async fn record(&self, webhook: PaymentWebhook) -> Result<InsertOutcome<PaymentWebhook>> {
        if let Some(existing) = self
            .store
            .find_by_event(&webhook.event_id, &webhook.processor_type)
            .await?
        {
            debug!(
                event_id = %existing.event_id,
                processor = %existing.processor_type,
                "duplicate webhook event"
            );
            return Ok(InsertOutcome::Duplicate(existing));
        }
        // The store's unique key still settles a race between two receivers.
        self.store.insert(webhook).await
    }

    /// `true` when the event is `processed` or currently `processing`.
    pub async fn is_handled_or_in_flight(
        &self,
        event_id: &str,
        processor_type: &ProcessorType,
    ) -> Result<bool> {
        Ok(self
            .store
            .find_by_event(event_id, processor_type)
            .await?
            .is_some_and(|webhook| webhook.is_handled_or_in_flight()))
    }

    /// Claims the row for this worker and counts the attempt.
    ///
    /// Returns `None` when another worker moved the row first.
    pub async fn begin_attempt(&self, webhook: &PaymentWebhook) -> Result<Option<PaymentWebhook>> {
        if webhook.status == WebhookStatus::Processing || webhook.status.is_final() {
            return Ok(None);
        }
        let now = self.ctx.now();
        let won = self
            .store
            .compare_and_set_status(webhook.id, webhook.status, WebhookStatus::Processing, now)
            .await?;
        if !won {
            return Ok(None);
        }
        let mut claimed = webhook.clone();
        claimed.status = WebhookStatus::Processing;
        claimed.processing_started_at = Some(now);
        claimed.attempts += 1;
        self.store.update(claimed.clone()).await?;
        Ok(Some(claimed))
    }

    pub async fn mark_processed(
        &self,
        mut webhook: PaymentWebhook,
        result: ResultCode,
    ) -> Result<PaymentWebhook> {
        webhook.status = WebhookStatus::Processed;
        webhook.result = Some(result);
        webhook.processed_at = Some(self.ctx.now());
        webhook.next_retry_at = None;
        self.store.update(webhook.clone()).await?;
        Ok(webhook)
    }

    /// Records a handler failure: schedules a retry, or gives up once
    /// attempts are exhausted.
    pub async fn mark_failed(
        &self,
        mut webhook: PaymentWebhook,
        error: &str,
    ) -> Result<PaymentWebhook> {
        let now = self.ctx.now();
        webhook.result = Some(ResultCode::Error);
        webhook.error_log = Some(error.to_string());
        let retry = self
            .retry
            .next_retry(webhook.attempts)
            .and_then(|delay| now.checked_add_signed(delay).map(|at| (delay, at)));
        match retry {
            Some((delay, retry_at)) => {
                webhook.status = WebhookStatus::Error;
                webhook.next_retry_at = Some(retry_at);
                info!(
                    webhook_id = %webhook.id,
                    attempts = webhook.attempts,
                    retry_in_secs = delay.num_seconds(),
                    "webhook handler failed, retry scheduled"
                );
            }
            None => {
                webhook.status = WebhookStatus::PermanentError;
                webhook.next_retry_at = None;
                webhook.processed_at = Some(now);
                warn!(
                    webhook_id = %webhook.id,
                    attempts = webhook.attempts,
                    "webhook retries exhausted"
                );
            }
        }
        self.store.update(webhook.clone()).await?;
        Ok(webhook)
    }

    /// Resets rows stuck in `processing` longer than `timeout` back to `new`.
    pub async fn reset_stuck(&self, timeout: Duration, limit: usize) -> Result<Vec<PaymentWebhook>> {
        let now = self.ctx.now();
        let stuck = self.store.find_stuck(now - timeout, limit).await?;
        let mut reset = Vec::with_capacity(stuck.len());
        for mut webhook in stuck {
            if self
                .store
                .compare_and_set_status(
                    webhook.id,
                    WebhookStatus::Processing,
                    WebhookStatus::New,
                    now,
                )
                .await?
            {
                warn!(
                    webhook_id = %webhook.id,
                    event_id = %webhook.event_id,
                    "reset stuck webhook"
                );
                webhook.status = WebhookStatus::New;
                webhook.processing_started_at = None;
                reset.push(webhook);
            }
        }
        Ok(reset)
    }

    pub async fn due_retries(
        &self,
        processor_type: &ProcessorType,
        limit: usize,
    ) -> Result<Vec<PaymentWebhook>> {
        self.store
            .find_due_retries(processor_type, self.ctx.now(), limit)
            .await
    }

    /// Moves an `error` row back to `new`. `false` if someone else got there first.
    pub async fn requeue(&self, webhook: &PaymentWebhook) -> Result<bool> {
        self.store
            .compare_and_set_status(
                webhook.id,
                WebhookStatus::Error,
                WebhookStatus::New,
                self.ctx.now(),
            )
            .await
    }
}
