//! Webhook queue runner.
//!
//! Drains a bounded number of items per processor queue. The queue item is
//! deleted once its webhook reaches a recorded outcome and released when the
//! run could not record one, so a failed run never loses work.

use super::registry::HandlerRegistry;
use super::webhook_log::WebhookLog;
use crate::domain::ports::{QueueItem, QueueTask, SharedWorkQueue};
use crate::domain::processor::ProcessorType;
use crate::domain::webhook::{PaymentWebhook, ResultCode, RetryPolicy, WebhookStatus};
use crate::error::{PaymentError, Result};
use chrono::Duration;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WebhookConfig {
    pub retry: RetryPolicy,
    pub stuck_timeout: Duration,
    pub stuck_reset_limit: usize,
    pub batch_size: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stuck_timeout: Duration::minutes(30),
            stuck_reset_limit: 100,
            batch_size: 50,
        }
    }
}

/// Which logical queues a run drains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTarget {
    All,
    Processor(ProcessorType),
}

impl std::str::FromStr for QueueTarget {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(QueueTarget::All)
        } else {
            Ok(QueueTarget::Processor(ProcessorType::new(s)?))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueRunSummary {
    pub processor_type: ProcessorType,
    /// Items whose webhook ended `processed`.
    pub processed: usize,
    /// Items whose handler failed (retry scheduled or permanent).
    pub failed: usize,
    /// Duplicate deliveries and lost claims.
    pub skipped: usize,
    /// Items put back because the run could not finish them.
    pub released: usize,
    pub requeued: usize,
    pub reset: usize,
    pub remaining: usize,
}

impl QueueRunSummary {
    fn new(processor_type: ProcessorType) -> Self {
        Self {
            processor_type,
            processed: 0,
            failed: 0,
            skipped: 0,
            released: 0,
            requeued: 0,
            reset: 0,
            remaining: 0,
        }
    }
}

enum ItemOutcome {
    Processed,
    Failed,
    Skipped,
}

pub struct WebhookQueueRunner {
    log: WebhookLog,
    queue: SharedWorkQueue,
    registry: Arc<HandlerRegistry>,
    config: WebhookConfig,
}

impl WebhookQueueRunner {
    pub fn new(
        log: WebhookLog,
        queue: SharedWorkQueue,
        registry: Arc<HandlerRegistry>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            log,
            queue,
            registry,
            config,
        }
    }

    /// Puts a webhook on its processor's queue.
    pub async fn enqueue(&self, webhook: &PaymentWebhook) -> Result<QueueItem> {
        self.queue
            .create(
                &webhook.processor_type,
                QueueTask {
                    webhook_id: webhook.id,
                },
            )
            .await
    }

    /// Full run: stuck sweep, due-retry requeue, then a bounded drain of each
    /// targeted queue.
    #[instrument(skip(self), fields(batch_size = self.config.batch_size))]
    pub async fn run(&self, target: QueueTarget) -> Result<Vec<QueueRunSummary>> {
        let mut processors: Vec<ProcessorType> = match &target {
            QueueTarget::Processor(processor) => vec![processor.clone()],
            QueueTarget::All => {
                let mut all = self.queue.queue_names().await?;
                all.extend(self.registry.processor_types());
                all
            }
        };

        let reset = self.sweep_stuck().await?;
        if target == QueueTarget::All {
            processors.extend(reset.keys().cloned());
        }
        processors.sort();
        processors.dedup();

        let mut summaries = Vec::with_capacity(processors.len());
        for processor in processors {
            let mut summary = self.run_processor(&processor).await?;
            summary.reset = reset.get(&processor).copied().unwrap_or(0);
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Requeues due retries and drains one processor queue. Does not sweep.
    pub async fn run_processor(&self, processor: &ProcessorType) -> Result<QueueRunSummary> {
        let mut summary = QueueRunSummary::new(processor.clone());
        summary.requeued = self.requeue_due(processor).await?;
        self.drain(processor, &mut summary).await;
        summary.remaining = self.queue.count(processor).await?;
        info!(
            processor = %processor,
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            released = summary.released,
            remaining = summary.remaining,
            "webhook queue run finished"
        );
        Ok(summary)
    }

    /// Resets stuck rows and puts them back on their queues. Counts per processor.
    async fn sweep_stuck(&self) -> Result<BTreeMap<ProcessorType, usize>> {
        let reset = self
            .log
            .reset_stuck(self.config.stuck_timeout, self.config.stuck_reset_limit)
            .await?;
        let mut counts = BTreeMap::new();
        for webhook in reset {
            self.enqueue(&webhook).await?;
            *counts.entry(webhook.processor_type.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn requeue_due(&self, processor: &ProcessorType) -> Result<usize> {
        let due = self
            .log
            .due_retries(processor, self.config.batch_size)
            .await?;
        let mut requeued = 0;
        for webhook in due {
            if self.log.requeue(&webhook).await? {
                self.enqueue(&webhook).await?;
                requeued += 1;
            }
        }
        if requeued > 0 {
            debug!(processor = %processor, requeued, "requeued webhooks due for retry");
        }
        Ok(requeued)
    }

    async fn drain(&self, processor: &ProcessorType, summary: &mut QueueRunSummary) {
        let mut released: HashSet<String> = HashSet::new();
        for _ in 0..self.config.batch_size {
            let item = match self.queue.claim(processor).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    error!(processor = %processor, error = %e, "failed to claim queue item");
                    break;
                }
            };
            if released.contains(&item.id) {
                // Only items this run already gave back are left.
                self.release(&item).await;
                break;
            }

            match self.process_item(&item).await {
                Ok(outcome) => {
                    match outcome {
                        ItemOutcome::Processed => summary.processed += 1,
                        ItemOutcome::Failed => summary.failed += 1,
                        ItemOutcome::Skipped => summary.skipped += 1,
                    }
                    if let Err(e) = self.queue.delete(&item).await {
                        error!(item = %item.id, error = %e, "failed to delete queue item");
                    }
                }
                Err(e) => {
                    warn!(
                        item = %item.id,
                        webhook_id = %item.task.webhook_id,
                        error = %e,
                        "queue item not finished, releasing"
                    );
                    self.release(&item).await;
                    released.insert(item.id.clone());
                    summary.released += 1;
                }
            }
        }
    }

    async fn release(&self, item: &QueueItem) {
        if let Err(e) = self.queue.release(item).await {
            error!(item = %item.id, error = %e, "failed to release queue item");
        }
    }

    async fn process_item(&self, item: &QueueItem) -> Result<ItemOutcome> {
        let Some(webhook) = self.log.store().get(item.task.webhook_id).await? else {
            warn!(webhook_id = %item.task.webhook_id, "queue item references unknown webhook");
            return Ok(ItemOutcome::Skipped);
        };

        if webhook.status.is_final() {
            debug!(webhook_id = %webhook.id, status = %webhook.status, "already handled");
            return Ok(ItemOutcome::Skipped);
        }
        if webhook.status == WebhookStatus::Processing {
            debug!(webhook_id = %webhook.id, "claimed by another worker");
            return Ok(ItemOutcome::Skipped);
        }
        if webhook.status == WebhookStatus::Error
            && webhook
                .next_retry_at
                .is_some_and(|retry_at| retry_at > self.log.now())
        {
            debug!(
                webhook_id = %webhook.id,
                next_retry_at = ?webhook.next_retry_at,
                "retry not due yet"
            );
            return Ok(ItemOutcome::Skipped);
        }

        let Some(claimed) = self.log.begin_attempt(&webhook).await? else {
            debug!(webhook_id = %webhook.id, "lost claim race");
            return Ok(ItemOutcome::Skipped);
        };

        let Some(handler) = self
            .registry
            .handler(&claimed.processor_type, &claimed.event_type)
        else {
            debug!(
                webhook_id = %claimed.id,
                event_type = %claimed.event_type,
                "no handler registered"
            );
            self.log
                .mark_processed(claimed, ResultCode::NoHandler)
                .await?;
            return Ok(ItemOutcome::Processed);
        };

        let invocation = AssertUnwindSafe(handler.handle(&claimed))
            .catch_unwind()
            .await;
        let result = match invocation {
            Ok(result) => result,
            Err(panic) => Err(PaymentError::HandlerError(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match result {
            Ok(outcome) => {
                self.log.mark_processed(claimed, outcome.into()).await?;
                Ok(ItemOutcome::Processed)
            }
            Err(e) => {
                self.log.mark_failed(claimed, &e.to_string()).await?;
                Ok(ItemOutcome::Failed)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
