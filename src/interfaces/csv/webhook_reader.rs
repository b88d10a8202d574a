use crate::application::ingest::InboundEvent;
use crate::domain::attempt::AttemptId;
use crate::domain::processor::ProcessorType;
use crate::error::{PaymentError, Result};
use serde::Deserialize;
use std::io::Read;

/// One row of a webhook events file.
///
/// `payload` is optional raw JSON; an empty column means no payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRecord {
    pub event_id: String,
    pub processor_type: ProcessorType,
    pub event_type: String,
    #[serde(default)]
    pub payment_attempt_id: Option<AttemptId>,
    #[serde(default)]
    pub payload: Option<String>,
}

impl WebhookRecord {
    pub fn into_event(self) -> Result<(ProcessorType, InboundEvent)> {
        if self.event_id.is_empty() {
            return Err(PaymentError::ValidationError(
                "Webhook event id cannot be empty".to_string(),
            ));
        }
        let payload = match self.payload.as_deref() {
            None | Some("") => serde_json::Value::Null,
            Some(raw) => serde_json::from_str(raw)?,
        };
        Ok((
            self.processor_type,
            InboundEvent {
                event_id: self.event_id,
                event_type: self.event_type,
                payment_attempt_id: self.payment_attempt_id,
                payload,
            },
        ))
    }
}

/// Reads webhook events from a CSV source.
///
/// Whitespace is trimmed and trailing optional columns may be omitted.
pub struct WebhookReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> WebhookReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily yields one result per row; a bad row does not end the stream.
    pub fn events(self) -> impl Iterator<Item = Result<(ProcessorType, InboundEvent)>> {
        self.reader
            .into_deserialize::<WebhookRecord>()
            .map(|result| result.map_err(PaymentError::from)?.into_event())
    }
}
