use super::registry::{HandlerRegistry, Payability};
use crate::domain::ledger::{Contribution, ContributionId};
use crate::domain::ports::SharedLedger;
use crate::domain::processor::ProcessorType;
use crate::error::{PaymentError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Answers "can this contribution be paid now" through processor providers.
pub struct PayabilityService {
    ledger: SharedLedger,
    registry: Arc<HandlerRegistry>,
}

impl PayabilityService {
    pub fn new(ledger: SharedLedger, registry: Arc<HandlerRegistry>) -> Self {
        Self { ledger, registry }
    }

    /// One provider call per processor type. Contributions without a
    /// processor, or whose processor has no provider, map to `None`.
    pub async fn resolve_payability(
        &self,
        ids: &[ContributionId],
    ) -> Result<HashMap<ContributionId, Option<Payability>>> {
        let mut found = self.ledger.get_contributions(ids).await?;
        if let Some(missing) = ids.iter().find(|id| !found.contains_key(id)) {
            return Err(PaymentError::not_found("contribution", missing));
        }

        let mut resolved = HashMap::with_capacity(found.len());
        let mut groups: BTreeMap<ProcessorType, Vec<Contribution>> = BTreeMap::new();
        for (id, contribution) in found.drain() {
            match contribution.processor_type.clone() {
                Some(processor) => groups.entry(processor).or_default().push(contribution),
                None => {
                    resolved.insert(id, None);
                }
            }
        }

        for (processor, contributions) in groups {
            let Some(provider) = self.registry.payability_provider(&processor) else {
                debug!(processor = %processor, "no payability provider registered");
                resolved.extend(contributions.iter().map(|c| (c.id, None)));
                continue;
            };
            let mut answers = provider.payability(&contributions).await?;
            resolved.extend(
                contributions
                    .iter()
                    .map(|c| (c.id, answers.remove(&c.id))),
            );
        }
        Ok(resolved)
    }
}
