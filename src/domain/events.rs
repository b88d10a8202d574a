use super::attempt::{AttemptId, PaymentAttempt};
use super::ledger::{Amount, ContributionId, RecurringId, TransactionCompletion};
use super::processor::ProcessorType;
use std::collections::HashMap;

/// What a processor reported for one stuck attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Charge went through. With completion data the core completes the
    /// ledger entry; without it the handler has already done so.
    Completed(Option<TransactionCompletion>),
    Failed { reason: Option<String> },
    Cancelled,
    Unchanged,
}

/// Asks subscribers to fetch authoritative status for stuck attempts of one processor.
#[derive(Debug, Clone)]
pub struct ReconcileBatchEvent {
    pub processor_type: ProcessorType,
    pub threshold_days: u32,
    limit: usize,
    attempts: Vec<PaymentAttempt>,
    results: HashMap<AttemptId, ReconcileOutcome>,
}

impl ReconcileBatchEvent {
    pub fn new(
        processor_type: ProcessorType,
        threshold_days: u32,
        limit: usize,
        mut attempts: Vec<PaymentAttempt>,
    ) -> Self {
        attempts.truncate(limit);
        Self {
            processor_type,
            threshold_days,
            limit,
            attempts,
            results: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn attempts(&self) -> &[PaymentAttempt] {
        &self.attempts
    }

    /// Adds an attempt found by a subscriber's own selection. Returns `false`
    /// when the batch is full or the attempt is already present.
    pub fn push_attempt(&mut self, attempt: PaymentAttempt) -> bool {
        if self.attempts.len() >= self.limit || self.attempts.iter().any(|a| a.id == attempt.id)
        {
            return false;
        }
        self.attempts.push(attempt);
        true
    }

    /// Records the outcome for an attempt in this batch. Unknown ids are ignored.
    pub fn set_result(&mut self, attempt_id: AttemptId, outcome: ReconcileOutcome) -> bool {
        if !self.attempts.iter().any(|a| a.id == attempt_id) {
            return false;
        }
        self.results.insert(attempt_id, outcome);
        true
    }

    pub fn result(&self, attempt_id: &AttemptId) -> Option<&ReconcileOutcome> {
        self.results.get(attempt_id)
    }

    pub fn into_parts(self) -> (Vec<PaymentAttempt>, HashMap<AttemptId, ReconcileOutcome>) {
        (self.attempts, self.results)
    }
}

/// One claimed instalment ready to be charged.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeItem {
    pub attempt: PaymentAttempt,
    pub contribution_id: ContributionId,
    pub recurring_id: RecurringId,
    pub payment_token: String,
    pub amount: Amount,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct ChargeBatchEvent {
    pub processor_type: ProcessorType,
    pub items: Vec<ChargeItem>,
}

#[derive(Debug, Clone)]
pub enum PaymentEvent {
    ReconcileBatch(ReconcileBatchEvent),
    ChargeBatch(ChargeBatchEvent),
}

impl PaymentEvent {
    pub fn processor_type(&self) -> &ProcessorType {
        match self {
            PaymentEvent::ReconcileBatch(event) => &event.processor_type,
            PaymentEvent::ChargeBatch(event) => &event.processor_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaymentEvent::ReconcileBatch(_) => "reconcile_batch",
            PaymentEvent::ChargeBatch(_) => "charge_batch",
        }
    }
}
