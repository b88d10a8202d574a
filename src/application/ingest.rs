//! Inbound webhook intake: parse, dedup, persist, enqueue.

use super::webhook_log::WebhookLog;
use crate::domain::attempt::AttemptId;
use crate::domain::ports::{InsertOutcome, QueueTask, SharedWorkQueue};
use crate::domain::processor::ProcessorType;
use crate::domain::webhook::PaymentWebhook;
use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// A raw delivery from a processor.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// One processor event extracted from a request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "id")]
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payment_attempt_id: Option<AttemptId>,
    #[serde(skip)]
    pub payload: serde_json::Value,
}

/// A processor integration's view of its own inbound requests.
pub trait WebhookReceiver: Send + Sync {
    fn processor_type(&self) -> &ProcessorType;

    /// Extracts every event carried by the request. Signature checks belong here.
    fn parse_events(&self, request: &InboundRequest) -> Result<Vec<InboundEvent>>;
}

/// Receiver for bodies of the form `{"id", "type", "payment_attempt_id"?}` or
/// an array of such objects.
pub struct JsonWebhookReceiver {
    processor_type: ProcessorType,
}

impl JsonWebhookReceiver {
    pub fn new(processor_type: ProcessorType) -> Self {
        Self { processor_type }
    }
}

impl WebhookReceiver for JsonWebhookReceiver {
    fn processor_type(&self) -> &ProcessorType {
        &self.processor_type
    }

    fn parse_events(&self, request: &InboundRequest) -> Result<Vec<InboundEvent>> {
        let body: serde_json::Value = serde_json::from_slice(&request.body)?;
        let raw = match body {
            serde_json::Value::Array(items) => items,
            object @ serde_json::Value::Object(_) => vec![object],
            _ => {
                return Err(PaymentError::ValidationError(
                    "Webhook body must be a JSON object or array".to_string(),
                ));
            }
        };
        raw.into_iter()
            .map(|value| {
                let mut event: InboundEvent = serde_json::from_value(value.clone())?;
                if event.event_id.trim().is_empty() {
                    return Err(PaymentError::ValidationError(
                        "Webhook event id cannot be empty".to_string(),
                    ));
                }
                event.payload = value;
                Ok(event)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub received: usize,
    pub duplicates: usize,
}

impl IngestSummary {
    pub fn add(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Queued => self.received += 1,
            IngestOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

pub struct WebhookIngestor {
    log: WebhookLog,
    queue: SharedWorkQueue,
}

impl WebhookIngestor {
    pub fn new(log: WebhookLog, queue: SharedWorkQueue) -> Self {
        Self { log, queue }
    }

    /// Logs the event as `new` and enqueues it. Known events are left alone.
    pub async fn ingest(
        &self,
        processor_type: &ProcessorType,
        event: InboundEvent,
    ) -> Result<IngestOutcome> {
        let webhook = PaymentWebhook::new(
            event.event_id,
            processor_type.clone(),
            event.event_type,
            event.payload,
            self.log.now(),
        )
        .with_attempt(event.payment_attempt_id);

        match self.log.record(webhook).await? {
            InsertOutcome::Duplicate(existing) => {
                debug!(webhook_id = %existing.id, status = %existing.status, "webhook already logged");
                Ok(IngestOutcome::Duplicate)
            }
            InsertOutcome::Inserted(webhook) => {
                self.queue
                    .create(
                        processor_type,
                        QueueTask {
                            webhook_id: webhook.id,
                        },
                    )
                    .await?;
                debug!(
                    webhook_id = %webhook.id,
                    event_id = %webhook.event_id,
                    processor = %processor_type,
                    "webhook queued"
                );
                Ok(IngestOutcome::Queued)
            }
        }
    }

    pub async fn receive(
        &self,
        receiver: &dyn WebhookReceiver,
        request: &InboundRequest,
    ) -> Result<IngestSummary> {
        let processor_type = receiver.processor_type().clone();
        let mut summary = IngestSummary::default();
        for event in receiver.parse_events(request)? {
            summary.add(self.ingest(&processor_type, event).await?);
        }
        info!(
            processor = %processor_type,
            received = summary.received,
            duplicates = summary.duplicates,
            "webhook request ingested"
        );
        Ok(summary)
    }
}
