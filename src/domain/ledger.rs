//! Records owned by the external accounting ledger.
//!
//! The core only reads these and writes through the narrow [`Ledger`](super::ports::Ledger)
//! port: completion, terminal failure, failure counting and instalment creation.

use super::processor::ProcessorType;
use crate::error::PaymentError;
use chrono::{Duration, Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type ContributionId = u64;
pub type ContactId = u64;
pub type RecurringId = u64;

/// A strictly positive monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Pending,
    PartiallyPaid,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: ContributionId,
    pub contact_id: ContactId,
    pub recurring_id: Option<RecurringId>,
    pub processor_type: Option<ProcessorType>,
    pub status: ContributionStatus,
    pub total_amount: Decimal,
    #[serde(default)]
    pub paid_amount: Decimal,
    pub currency: String,
    pub receive_date: NaiveDate,
    #[serde(default)]
    pub is_pay_later: bool,
}

impl Contribution {
    pub fn outstanding(&self) -> Decimal {
        self.total_amount - self.paid_amount
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            ContributionStatus::Pending | ContributionStatus::PartiallyPaid
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyUnit {
    Day,
    Week,
    Month,
    Year,
}

/// A recurring payment schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringContribution {
    pub id: RecurringId,
    pub contact_id: ContactId,
    pub payment_processor_id: u64,
    pub processor_type: ProcessorType,
    pub status: RecurringStatus,
    pub payment_token: Option<String>,
    #[serde(default)]
    pub failure_count: u32,
    pub amount: Decimal,
    pub currency: String,
    pub frequency_unit: FrequencyUnit,
    pub frequency_interval: u32,
    pub next_sched_date: Option<NaiveDate>,
    /// Total number of instalments, `None` for open-ended schedules.
    #[serde(default)]
    pub installments: Option<u32>,
}

impl RecurringContribution {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            RecurringStatus::Pending | RecurringStatus::InProgress
        )
    }

    pub fn has_payment_method(&self) -> bool {
        self.payment_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }

    /// The scheduled date following `date` for this schedule's frequency.
    pub fn next_date_after(&self, date: NaiveDate) -> Option<NaiveDate> {
        let interval = self.frequency_interval.max(1);
        match self.frequency_unit {
            FrequencyUnit::Day => date.checked_add_signed(Duration::days(interval.into())),
            FrequencyUnit::Week => date.checked_add_signed(Duration::weeks(interval.into())),
            FrequencyUnit::Month => date.checked_add_months(Months::new(interval)),
            FrequencyUnit::Year => date.checked_add_months(Months::new(interval * 12)),
        }
    }
}

/// Settlement data a processor reports for a completed charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCompletion {
    pub contribution_id: ContributionId,
    pub trxn_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub fee_amount: Option<Decimal>,
    pub trxn_date: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn schedule(unit: FrequencyUnit, interval: u32) -> RecurringContribution {
        RecurringContribution {
            id: 1,
            contact_id: 1,
            payment_processor_id: 1,
            processor_type: ProcessorType::new("stripe").unwrap(),
            status: RecurringStatus::InProgress,
            payment_token: Some("tok_1".to_string()),
            failure_count: 0,
            amount: dec!(10.00),
            currency: "GBP".to_string(),
            frequency_unit: unit,
            frequency_interval: interval,
            next_sched_date: None,
            installments: None,
        }
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(0.01)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(PaymentError::ValidationError(_))
        ));
    }

    #[test]
    fn test_next_date_after() {
        let jan31 = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        assert_eq!(
            schedule(FrequencyUnit::Month, 1).next_date_after(jan31),
            NaiveDate::from_ymd_opt(2026, 2, 28)
        );
        assert_eq!(
            schedule(FrequencyUnit::Week, 2).next_date_after(jan31),
            NaiveDate::from_ymd_opt(2026, 2, 14)
        );
        assert_eq!(
            schedule(FrequencyUnit::Year, 1).next_date_after(jan31),
            NaiveDate::from_ymd_opt(2027, 1, 31)
        );
    }

    #[test]
    fn test_payment_method_requires_token() {
        let mut s = schedule(FrequencyUnit::Month, 1);
        assert!(s.has_payment_method());
        s.payment_token = Some("  ".to_string());
        assert!(!s.has_payment_method());
        s.payment_token = None;
        assert!(!s.has_payment_method());
    }

    #[test]
    fn test_outstanding() {
        let c = Contribution {
            id: 1,
            contact_id: 1,
            recurring_id: None,
            processor_type: None,
            status: ContributionStatus::PartiallyPaid,
            total_amount: dec!(50.00),
            paid_amount: dec!(20.00),
            currency: "GBP".to_string(),
            receive_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            is_pay_later: false,
        };
        assert_eq!(c.outstanding(), dec!(30.00));
        assert!(c.is_open());
    }
}
