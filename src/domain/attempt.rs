use super::ledger::{ContactId, ContributionId};
use super::processor::ProcessorType;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type AttemptId = Uuid;

/// Lifecycle of a single charge try.
///
/// `pending -> processing -> {completed, failed, cancelled}`. Every move into
/// `processing` goes through a compare-and-swap on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub const ALL: [AttemptStatus; 5] = [
        AttemptStatus::Pending,
        AttemptStatus::Processing,
        AttemptStatus::Completed,
        AttemptStatus::Failed,
        AttemptStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Processing => "processing",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Completed | AttemptStatus::Failed | AttemptStatus::Cancelled
        )
    }

    /// Statuses that keep a contribution out of the instalment charge run.
    pub fn blocks_charge(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Processing | AttemptStatus::Completed | AttemptStatus::Cancelled
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttemptStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                PaymentError::ValidationError(format!("Unknown payment attempt status '{s}'"))
            })
    }
}

/// One charge attempt against a contribution. At most one per contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: AttemptId,
    pub contribution_id: ContributionId,
    pub contact_id: ContactId,
    pub payment_processor_id: u64,
    pub processor_type: ProcessorType,
    pub processor_session_id: Option<String>,
    pub processor_payment_id: Option<String>,
    pub status: AttemptStatus,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

impl PaymentAttempt {
    /// Builds a fresh `pending` attempt.
    pub fn pending(
        contribution_id: ContributionId,
        contact_id: ContactId,
        payment_processor_id: u64,
        processor_type: ProcessorType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contribution_id,
            contact_id,
            payment_processor_id,
            processor_type,
            processor_session_id: None,
            processor_payment_id: None,
            status: AttemptStatus::Pending,
            created_date: now,
            updated_date: now,
        }
    }
}
