use super::attempt::AttemptId;
use super::processor::ProcessorType;
use crate::error::PaymentError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type WebhookId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    New,
    Processing,
    Processed,
    Error,
    PermanentError,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::New => "new",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Error => "error",
            WebhookStatus::PermanentError => "permanent_error",
        }
    }

    /// Nothing left to do for this event.
    pub fn is_final(&self) -> bool {
        matches!(self, WebhookStatus::Processed | WebhookStatus::PermanentError)
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(WebhookStatus::New),
            "processing" => Ok(WebhookStatus::Processing),
            "processed" => Ok(WebhookStatus::Processed),
            "error" => Ok(WebhookStatus::Error),
            "permanent_error" => Ok(WebhookStatus::PermanentError),
            other => Err(PaymentError::ValidationError(format!(
                "Unknown webhook status '{other}'"
            ))),
        }
    }
}

/// Outcome recorded on a webhook row once it leaves `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Applied,
    Noop,
    IgnoredOutOfOrder,
    Error,
    NoHandler,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Applied => "applied",
            ResultCode::Noop => "noop",
            ResultCode::IgnoredOutOfOrder => "ignored_out_of_order",
            ResultCode::Error => "error",
            ResultCode::NoHandler => "no_handler",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logged inbound processor event. `(event_id, processor_type)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentWebhook {
    pub id: WebhookId,
    pub event_id: String,
    pub processor_type: ProcessorType,
    pub event_type: String,
    pub payment_attempt_id: Option<AttemptId>,
    pub status: WebhookStatus,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result: Option<ResultCode>,
    pub error_log: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_date: DateTime<Utc>,
    /// Raw event body, kept so a retry can be replayed without the original request.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PaymentWebhook {
    pub fn new(
        event_id: impl Into<String>,
        processor_type: ProcessorType,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event_id.into(),
            processor_type,
            event_type: event_type.into(),
            payment_attempt_id: None,
            status: WebhookStatus::New,
            attempts: 0,
            next_retry_at: None,
            result: None,
            error_log: None,
            processing_started_at: None,
            processed_at: None,
            created_date: now,
            payload,
        }
    }

    pub fn with_attempt(mut self, attempt_id: Option<AttemptId>) -> Self {
        self.payment_attempt_id = attempt_id;
        self
    }

    /// `true` while the event counts as handled or in flight.
    ///
    /// A `processing` row counts until the stuck sweep resets it, so the
    /// answer can flip back to `false` for the same event.
    pub fn is_handled_or_in_flight(&self) -> bool {
        matches!(
            self.status,
            WebhookStatus::Processed | WebhookStatus::Processing
        )
    }
}

/// Exponential backoff for failed webhook handlers.
///
/// `delay(n) = base_delay * factor^(n-1)`; a failure on attempt
/// `max_attempts + 1` is terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::minutes(5),
            factor: 3,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Saturates at `Duration::MAX` instead of wrapping on large attempt counts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = i32::try_from(self.factor.saturating_pow(exponent)).unwrap_or(i32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Delay before the next try, or `None` once retries are exhausted.
    pub fn next_retry(&self, attempts: u32) -> Option<Duration> {
        if attempts > self.max_attempts {
            None
        } else {
            Some(self.delay(attempts))
        }
    }
}
