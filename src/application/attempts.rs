use super::context::RunContext;
use crate::domain::attempt::{AttemptId, AttemptStatus, PaymentAttempt};
use crate::domain::ledger::{Contribution, RecurringContribution};
use crate::domain::ports::{InsertOutcome, SharedAttemptStore};
use crate::error::{PaymentError, Result};
use tracing::debug;

/// Service over the payment attempt ledger.
///
/// Every claim is a compare-and-swap; losing one is a normal `false`, never an error.
#[derive(Clone)]
pub struct AttemptLedger {
    store: SharedAttemptStore,
    ctx: RunContext,
}

impl AttemptLedger {
    pub fn new(store: SharedAttemptStore, ctx: RunContext) -> Self {
        Self { store, ctx }
    }

    pub fn store(&self) -> &SharedAttemptStore {
        &self.store
    }

    pub async fn get(&self, id: AttemptId) -> Result<PaymentAttempt> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::not_found("payment attempt", id))
    }

    /// Creates a `pending` attempt for an instalment of `schedule`.
    ///
    /// A second create for the same contribution comes back as `Duplicate`
    /// carrying the row that won.
    pub async fn create_pending(
        &self,
        contribution: &Contribution,
        schedule: &RecurringContribution,
    ) -> Result<InsertOutcome<PaymentAttempt>> {
        let attempt = PaymentAttempt::pending(
            contribution.id,
            contribution.contact_id,
            schedule.payment_processor_id,
            schedule.processor_type.clone(),
            self.ctx.now(),
        );
        self.store.insert(attempt).await
    }

    /// The contribution's attempt, creating a `pending` one if it has none yet.
    pub async fn find_or_create_pending(
        &self,
        contribution: &Contribution,
        schedule: &RecurringContribution,
    ) -> Result<PaymentAttempt> {
        if let Some(existing) = self.store.find_by_contribution(contribution.id).await? {
            return Ok(existing);
        }
        Ok(self
            .create_pending(contribution, schedule)
            .await?
            .into_inner())
    }

    pub async fn claim(&self, id: AttemptId) -> Result<bool> {
        self.transition(id, AttemptStatus::Pending, AttemptStatus::Processing)
            .await
    }

    pub async fn transition(
        &self,
        id: AttemptId,
        from: AttemptStatus,
        to: AttemptStatus,
    ) -> Result<bool> {
        let won = self
            .store
            .compare_and_set_status(id, from, to, self.ctx.now())
            .await?;
        debug!(attempt_id = %id, %from, %to, won, "attempt transition");
        Ok(won)
    }

    /// Conditional transition from status names; both are validated before any write.
    pub async fn transition_named(&self, id: AttemptId, from: &str, to: &str) -> Result<bool> {
        let from: AttemptStatus = from.parse()?;
        let to: AttemptStatus = to.parse()?;
        self.transition(id, from, to).await
    }

    pub async fn set_status(&self, id: AttemptId, status: AttemptStatus) -> Result<()> {
        self.store.set_status(id, status, self.ctx.now()).await
    }

    /// Unconditional write from a status name, rejected before touching storage
    /// if the name is unknown.
    pub async fn set_status_named(&self, id: AttemptId, status: &str) -> Result<()> {
        let status: AttemptStatus = status.parse()?;
        self.set_status(id, status).await
    }

    pub async fn record_processor_refs(
        &self,
        id: AttemptId,
        session_id: Option<String>,
        payment_id: Option<String>,
    ) -> Result<()> {
        self.store
            .set_processor_refs(id, session_id, payment_id, self.ctx.now())
            .await
    }
}
