//! Instalment generation and batch charging for recurring schedules.

use super::attempts::AttemptLedger;
use super::context::RunContext;
use crate::domain::attempt::{AttemptStatus, PaymentAttempt};
use crate::domain::events::{ChargeBatchEvent, ChargeItem, PaymentEvent};
use crate::domain::ledger::{
    Amount, Contribution, ContributionId, RecurringContribution, RecurringId,
};
use crate::domain::ports::{ChargeCriteria, SharedEventBus, SharedLedger};
use crate::domain::processor::ProcessorType;
use crate::error::{PaymentError, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub processor_type: ProcessorType,
    pub batch_size: usize,
    /// Defaults to today.
    pub reference_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerateSummary {
    pub created: usize,
    pub skipped: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub processor_types: Vec<ProcessorType>,
    /// Per processor type, not shared.
    pub batch_size: usize,
    pub max_retry_count: u32,
    /// Defaults to today.
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeSummary {
    pub processor_type: ProcessorType,
    pub charged: usize,
    pub skipped: usize,
    pub errored: usize,
}

pub struct InstalmentOrchestrator {
    attempts: AttemptLedger,
    ledger: SharedLedger,
    bus: SharedEventBus,
    ctx: RunContext,
}

impl InstalmentOrchestrator {
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

    /// Creates the next pending instalment of every due schedule.
    #[instrument(skip(self, request), fields(processor = %request.processor_type))]
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateSummary> {
        let as_of = request.reference_date.unwrap_or_else(|| self.ctx.today());
        let schedules = self
            .ledger
            .find_due_schedules(&request.processor_type, as_of, request.batch_size)
            .await?;

        let mut summary = GenerateSummary::default();
        for schedule in &schedules {
            match self.generate_one(schedule).await {
                Ok(true) => summary.created += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    warn!(recurring_id = schedule.id, error = %e, "failed to generate instalment");
                    summary.errored += 1;
                }
            }
        }
        info!(
            created = summary.created,
            skipped = summary.skipped,
            errored = summary.errored,
            "instalment generation finished"
        );
        Ok(summary)
    }

    async fn generate_one(&self, schedule: &RecurringContribution) -> Result<bool> {
        let Some(due) = schedule.next_sched_date else {
            return Ok(false);
        };
        let existing = self.ledger.count_instalments(schedule.id).await?;
        if schedule.installments.is_some_and(|limit| existing >= limit) {
            self.ledger.advance_schedule(schedule.id, None, true).await?;
            return Ok(false);
        }

        let created = match self.ledger.find_instalment(schedule.id, due).await? {
            Some(found) => {
                debug!(recurring_id = schedule.id, contribution_id = found.id, "instalment exists");
                false
            }
            None => {
                let contribution = self.ledger.create_instalment(schedule, due).await?;
                debug!(
                    recurring_id = schedule.id,
                    contribution_id = contribution.id,
                    %due,
                    "instalment created"
                );
                true
            }
        };

        let count = self.ledger.count_instalments(schedule.id).await?;
        let completed = schedule.installments.is_some_and(|limit| count >= limit);
        let next = if completed {
            None
        } else {
            schedule.next_date_after(due)
        };
        self.ledger
            .advance_schedule(schedule.id, next, completed)
            .await?;
        Ok(created)
    }

    /// Claims every eligible instalment and publishes one charge batch per
    /// processor type. Processor types run one after another.
    #[instrument(skip(self, request), fields(batch_size = request.batch_size))]
    pub async fn charge(&self, request: &ChargeRequest) -> Result<Vec<ChargeSummary>> {
        let as_of = request.as_of.unwrap_or_else(|| self.ctx.today());
        let mut summaries = Vec::with_capacity(request.processor_types.len());
        for processor in &request.processor_types {
            let criteria = ChargeCriteria {
                processor_type: processor.clone(),
                as_of,
                max_failure_count: request.max_retry_count,
            };
            summaries.push(self.charge_processor(&criteria, request.batch_size).await?);
        }
        Ok(summaries)
    }

    async fn charge_processor(
        &self,
        criteria: &ChargeCriteria,
        batch_size: usize,
    ) -> Result<ChargeSummary> {
        let mut summary = ChargeSummary {
            processor_type: criteria.processor_type.clone(),
            charged: 0,
            skipped: 0,
            errored: 0,
        };
        let mut items: Vec<ChargeItem> = Vec::new();
        let mut after: Option<ContributionId> = None;

        while items.len() < batch_size {
            let page = self
                .ledger
                .find_chargeable(criteria, after, batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            let contribution_ids: Vec<ContributionId> = page.iter().map(|c| c.id).collect();
            let recurring_ids: Vec<RecurringId> =
                page.iter().filter_map(|c| c.recurring_id).collect();
            let schedules = self.ledger.get_recurring(&recurring_ids).await?;
            let mut existing = self
                .attempts
                .store()
                .find_by_contributions(&contribution_ids)
                .await?;

            for contribution in &page {
                if items.len() >= batch_size {
                    break;
                }
                let attempt = existing.remove(&contribution.id);
                match self.claim_instalment(contribution, &schedules, attempt).await {
                    Ok(Some(item)) => items.push(item),
                    Ok(None) => summary.skipped += 1,
                    Err(e) => {
                        warn!(
                            contribution_id = contribution.id,
                            error = %e,
                            "failed to claim instalment"
                        );
                        summary.errored += 1;
                    }
                }
            }

            if page.len() < batch_size {
                break;
            }
        }

        if !items.is_empty() {
            let count = items.len();
            let mut event = PaymentEvent::ChargeBatch(ChargeBatchEvent {
                processor_type: criteria.processor_type.clone(),
                items,
            });
            match self.bus.publish(&mut event).await {
                Ok(()) => summary.charged = count,
                Err(e) => {
                    error!(processor = %criteria.processor_type, error = %e, "charge batch failed");
                    summary.errored += count;
                }
            }
        }

        info!(
            processor = %summary.processor_type,
            charged = summary.charged,
            skipped = summary.skipped,
            errored = summary.errored,
            "instalment charge run finished"
        );
        Ok(summary)
    }

    /// Moves the contribution's attempt to `processing`. `None` when the
    /// contribution is already being charged or another worker won the claim.
    async fn claim_instalment(
        &self,
        contribution: &Contribution,
        schedules: &HashMap<RecurringId, RecurringContribution>,
        existing: Option<PaymentAttempt>,
    ) -> Result<Option<ChargeItem>> {
        let recurring_id = contribution.recurring_id.ok_or_else(|| {
            PaymentError::ValidationError(format!(
                "Contribution {} has no recurring schedule",
                contribution.id
            ))
        })?;
        let schedule = schedules
            .get(&recurring_id)
            .ok_or_else(|| PaymentError::not_found("recurring contribution", recurring_id))?;

        let mut attempt = match existing {
            Some(attempt) => attempt,
            None => self
                .attempts
                .create_pending(contribution, schedule)
                .await?
                .into_inner(),
        };
        match attempt.status {
            status if status.blocks_charge() => return Ok(None),
            AttemptStatus::Failed => {
                if !self
                    .attempts
                    .transition(attempt.id, AttemptStatus::Failed, AttemptStatus::Pending)
                    .await?
                {
                    return Ok(None);
                }
            }
            _ => {}
        }
        if !self.attempts.claim(attempt.id).await? {
            return Ok(None);
        }
        attempt.status = AttemptStatus::Processing;

        let payment_token = schedule.payment_token.clone().ok_or_else(|| {
            PaymentError::ValidationError(format!(
                "Recurring contribution {recurring_id} has no payment method"
            ))
        })?;
        Ok(Some(ChargeItem {
            attempt,
            contribution_id: contribution.id,
            recurring_id,
            payment_token,
            amount: Amount::new(contribution.outstanding())?,
            currency: contribution.currency.clone(),
        }))
    }
}
