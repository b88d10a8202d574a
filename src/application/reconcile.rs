//! Reconciliation of payment attempts stuck in `processing`.
//!
//! Processors are visited in the order given and share one budget: each gets
//! whatever the earlier ones left over.

use super::attempts::AttemptLedger;
use super::context::RunContext;
use crate::domain::attempt::{AttemptStatus, PaymentAttempt};
use crate::domain::events::{PaymentEvent, ReconcileBatchEvent, ReconcileOutcome};
use crate::domain::ledger::{
    Contribution, ContributionId, ContributionStatus, RecurringContribution, RecurringId,
};
use crate::domain::ports::{SharedEventBus, SharedLedger};
use crate::domain::processor::ProcessorType;
use crate::error::{PaymentError, Result};
use chrono::Duration;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use tracing::{debug, error, info, instrument, warn};

/// How long an attempt of one processor may sit in `processing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckThreshold {
    pub processor_type: ProcessorType,
    pub days: u32,
}

impl FromStr for StuckThreshold {
    type Err = PaymentError;

    /// Parses `processor=days`, e.g. `stripe=2`.
    fn from_str(s: &str) -> Result<Self> {
        let (processor, days) = s.split_once('=').ok_or_else(|| {
            PaymentError::ValidationError(format!("Expected processor=days, got '{s}'"))
        })?;
        let days = days.trim().parse::<u32>().map_err(|_| {
            PaymentError::ValidationError(format!("Invalid threshold days in '{s}'"))
        })?;
        Ok(Self {
            processor_type: ProcessorType::new(processor)?,
            days,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub thresholds: Vec<StuckThreshold>,
    /// Total attempts examined across all processors.
    pub batch_size: usize,
    pub max_retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorReconcile {
    pub processor_type: ProcessorType,
    pub examined: usize,
    pub reconciled: usize,
    pub unchanged: usize,
    pub errored: usize,
    pub unhandled: usize,
}

impl ProcessorReconcile {
    fn new(processor_type: ProcessorType) -> Self {
        Self {
            processor_type,
            examined: 0,
            reconciled: 0,
            unchanged: 0,
            errored: 0,
            unhandled: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub processors: Vec<ProcessorReconcile>,
}

impl ReconcileSummary {
    pub fn examined(&self) -> usize {
        self.processors.iter().map(|p| p.examined).sum()
    }

    pub fn reconciled(&self) -> usize {
        self.processors.iter().map(|p| p.reconciled).sum()
    }

    pub fn unchanged(&self) -> usize {
        self.processors.iter().map(|p| p.unchanged).sum()
    }

    pub fn errored(&self) -> usize {
        self.processors.iter().map(|p| p.errored).sum()
    }

    pub fn unhandled(&self) -> usize {
        self.processors.iter().map(|p| p.unhandled).sum()
    }
}

enum Applied {
    Reconciled,
    Unchanged,
    Unhandled,
    /// Another run settled the attempt between selection and apply.
    LostRace,
}

/// Lookups for one processor batch, fetched once up front.
struct BatchContext {
    contributions: HashMap<ContributionId, Contribution>,
    schedules: HashMap<RecurringId, RecurringContribution>,
}

impl BatchContext {
    fn contribution(&self, id: ContributionId) -> Result<&Contribution> {
        self.contributions
            .get(&id)
            .ok_or_else(|| PaymentError::not_found("contribution", id))
    }
}

pub struct ReconciliationOrchestrator {
    attempts: AttemptLedger,
    ledger: SharedLedger,
    bus: SharedEventBus,
    ctx: RunContext,
}

impl ReconciliationOrchestrator {
    pub fn new(
        attempts: AttemptLedger,
        ledger: SharedLedger,
        bus: SharedEventBus,
        ctx: RunContext,
    ) -> Self {
        Self {
            attempts,
            ledger,
            bus,
            ctx,
        }
    }

    #[instrument(skip(self, request), fields(batch_size = request.batch_size))]
    pub async fn run(&self, request: &ReconcileRequest) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut consumed = 0usize;

        for threshold in &request.thresholds {
            let remaining = request.batch_size.saturating_sub(consumed);
            let mut tally = ProcessorReconcile::new(threshold.processor_type.clone());
            if remaining == 0 {
                debug!(processor = %threshold.processor_type, "reconcile budget exhausted");
                summary.processors.push(tally);
                continue;
            }

            let (batch, published) = self.dispatch(threshold, remaining).await?;
            let (attempts, mut results) = batch.into_parts();
            consumed += attempts.len();
            tally.examined = attempts.len();
            if let Err(e) = published {
                error!(
                    processor = %threshold.processor_type,
                    error = %e,
                    "reconcile subscribers failed"
                );
                tally.errored = attempts.len();
                summary.processors.push(tally);
                continue;
            }

            let batch_ctx = match self.prefetch(&attempts).await {
                Ok(batch_ctx) => batch_ctx,
                Err(e) => {
                    error!(processor = %threshold.processor_type, error = %e, "ledger lookup failed");
                    tally.errored = attempts.len();
                    summary.processors.push(tally);
                    continue;
                }
            };
            for attempt in &attempts {
                let outcome = results.remove(&attempt.id);
                match self
                    .apply(attempt, outcome, &batch_ctx, request.max_retry_count)
                    .await
                {
                    Ok(Applied::Reconciled) => tally.reconciled += 1,
                    Ok(Applied::Unchanged | Applied::LostRace) => tally.unchanged += 1,
                    Ok(Applied::Unhandled) => tally.unhandled += 1,
                    Err(e) => {
                        warn!(
                            attempt_id = %attempt.id,
                            contribution_id = attempt.contribution_id,
                            error = %e,
                            "failed to apply reconcile result"
                        );
                        tally.errored += 1;
                    }
                }
            }

            info!(
                processor = %tally.processor_type,
                examined = tally.examined,
                reconciled = tally.reconciled,
                unchanged = tally.unchanged,
                errored = tally.errored,
                unhandled = tally.unhandled,
                "reconcile batch finished"
            );
            summary.processors.push(tally);
        }
        Ok(summary)
    }

    /// Selects stuck attempts and publishes the batch. The publish result is
    /// handed back with the event so the caller can count what it covered.
    async fn dispatch(
        &self,
        threshold: &StuckThreshold,
        limit: usize,
    ) -> Result<(ReconcileBatchEvent, Result<()>)> {
        let cutoff = self.ctx.now() - Duration::days(i64::from(threshold.days));
        let stuck = self
            .attempts
            .store()
            .find_stuck(&threshold.processor_type, cutoff, limit)
            .await?;
        debug!(
            processor = %threshold.processor_type,
            stuck = stuck.len(),
            limit,
            "dispatching reconcile batch"
        );

        let mut event = PaymentEvent::ReconcileBatch(ReconcileBatchEvent::new(
            threshold.processor_type.clone(),
            threshold.days,
            limit,
            stuck,
        ));
        let published = self.bus.publish(&mut event).await;
        let PaymentEvent::ReconcileBatch(batch) = event else {
            return Err(PaymentError::HandlerError(
                "reconcile subscriber replaced the batch event".to_string(),
            ));
        };
        Ok((batch, published))
    }

    async fn prefetch(&self, attempts: &[PaymentAttempt]) -> Result<BatchContext> {
        let contribution_ids: Vec<ContributionId> =
            attempts.iter().map(|a| a.contribution_id).collect();
        let contributions = self.ledger.get_contributions(&contribution_ids).await?;
        let recurring_ids: Vec<RecurringId> = contributions
            .values()
            .filter_map(|c| c.recurring_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let schedules = self.ledger.get_recurring(&recurring_ids).await?;
        Ok(BatchContext {
            contributions,
            schedules,
        })
    }

    async fn apply(
        &self,
        attempt: &PaymentAttempt,
        outcome: Option<ReconcileOutcome>,
        batch: &BatchContext,
        max_retry_count: u32,
    ) -> Result<Applied> {
        let Some(outcome) = outcome else {
            return Ok(Applied::Unhandled);
        };
        match outcome {
            ReconcileOutcome::Unchanged => Ok(Applied::Unchanged),
            ReconcileOutcome::Completed(completion) => {
                if let Some(completion) = &completion
                    && completion.contribution_id != attempt.contribution_id
                {
                    return Err(PaymentError::ValidationError(format!(
                        "completion for contribution {} does not match attempt {} on contribution {}",
                        completion.contribution_id, attempt.id, attempt.contribution_id
                    )));
                }
                if !self.settle(attempt, AttemptStatus::Completed).await? {
                    return Ok(Applied::LostRace);
                }
                if let Some(completion) = completion {
                    self.ledger.complete_contribution(&completion).await?;
                }
                Ok(Applied::Reconciled)
            }
            ReconcileOutcome::Failed { reason } => {
                let contribution = batch.contribution(attempt.contribution_id)?;
                if let Some(recurring_id) = contribution.recurring_id
                    && !batch.schedules.contains_key(&recurring_id)
                {
                    return Err(PaymentError::not_found("recurring contribution", recurring_id));
                }
                if !self.settle(attempt, AttemptStatus::Failed).await? {
                    return Ok(Applied::LostRace);
                }
                if let Some(recurring_id) = contribution.recurring_id {
                    let failures = self.ledger.increment_failure_count(recurring_id).await?;
                    if failures > max_retry_count && !contribution.is_pay_later {
                        let reason = reason.as_deref().unwrap_or("payment failed");
                        self.ledger
                            .mark_contribution_failed(contribution.id, reason)
                            .await?;
                        info!(
                            contribution_id = contribution.id,
                            failures, "contribution failed after too many attempts"
                        );
                    }
                }
                Ok(Applied::Reconciled)
            }
            ReconcileOutcome::Cancelled => {
                let contribution = batch.contribution(attempt.contribution_id)?;
                if !self.settle(attempt, AttemptStatus::Cancelled).await? {
                    return Ok(Applied::LostRace);
                }
                if contribution.status == ContributionStatus::Pending && !contribution.is_pay_later
                {
                    self.ledger
                        .mark_contribution_failed(contribution.id, "payment cancelled")
                        .await?;
                }
                Ok(Applied::Reconciled)
            }
        }
    }

    /// Moves the attempt out of `processing`. Returns false when another
    /// run got there first; the caller must then leave the ledger alone.
    async fn settle(&self, attempt: &PaymentAttempt, to: AttemptStatus) -> Result<bool> {
        let moved = self
            .attempts
            .transition(attempt.id, AttemptStatus::Processing, to)
            .await?;
        if !moved {
            debug!(
                attempt_id = %attempt.id,
                to = %to,
                "attempt already left processing, skipping reconcile result"
            );
        }
        Ok(moved)
    }
}
