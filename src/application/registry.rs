//! Capability registry for processor plugins.
//!
//! Webhook handlers are keyed by `(processor type, event type)`, payability
//! providers by processor type. Whatever shape a plugin has, it is wrapped into
//! one trait object at registration time so lookups never inspect types.

use crate::domain::ledger::{Contribution, ContributionId};
use crate::domain::processor::ProcessorType;
use crate::domain::webhook::{PaymentWebhook, ResultCode};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// What a handler did with an event. Failures are reported as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Applied,
    Noop,
    IgnoredOutOfOrder,
}

impl From<HandlerOutcome> for ResultCode {
    fn from(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Applied => ResultCode::Applied,
            HandlerOutcome::Noop => ResultCode::Noop,
            HandlerOutcome::IgnoredOutOfOrder => ResultCode::IgnoredOutOfOrder,
        }
    }
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, webhook: &PaymentWebhook) -> Result<HandlerOutcome>;
}

/// Adapts a plain async closure into a [`WebhookHandler`].
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> WebhookHandler for HandlerFn<F>
where
    F: Fn(PaymentWebhook) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
{
    async fn handle(&self, webhook: &PaymentWebhook) -> Result<HandlerOutcome> {
        (self.0)(webhook.clone()).await
    }
}

/// Whether a contribution can be paid right now through its processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payability {
    pub can_pay_now: bool,
    pub reason: Option<String>,
    pub payment_url: Option<String>,
}

#[async_trait]
pub trait PayabilityProvider: Send + Sync {
    async fn payability(
        &self,
        contributions: &[Contribution],
    ) -> Result<HashMap<ContributionId, Payability>>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<(ProcessorType, String), Arc<dyn WebhookHandler>>,
    payability: HashMap<ProcessorType, Arc<dyn PayabilityProvider>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, processor: ProcessorType, event_type: &str, handler: H)
    where
        H: WebhookHandler + 'static,
    {
        self.register_shared(processor, event_type, Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, processor: ProcessorType, event_type: &str, f: F)
    where
        F: Fn(PaymentWebhook) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
    {
        self.register(processor, event_type, HandlerFn::new(f));
    }

    pub fn register_shared(
        &mut self,
        processor: ProcessorType,
        event_type: &str,
        handler: Arc<dyn WebhookHandler>,
    ) {
        info!(processor = %processor, event_type, "registering webhook handler");
        self.handlers
            .insert((processor, event_type.to_string()), handler);
    }

    pub fn register_payability(
        &mut self,
        processor: ProcessorType,
        provider: Arc<dyn PayabilityProvider>,
    ) {
        info!(processor = %processor, "registering payability provider");
        self.payability.insert(processor, provider);
    }

    pub fn handler(
        &self,
        processor: &ProcessorType,
        event_type: &str,
    ) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers
            .get(&(processor.clone(), event_type.to_string()))
            .cloned()
    }

    pub fn payability_provider(
        &self,
        processor: &ProcessorType,
    ) -> Option<Arc<dyn PayabilityProvider>> {
        self.payability.get(processor).cloned()
    }

    /// Every processor type with at least one registered capability.
    pub fn processor_types(&self) -> Vec<ProcessorType> {
        let types: BTreeSet<ProcessorType> = self
            .handlers
            .keys()
            .map(|(processor, _)| processor.clone())
            .chain(self.payability.keys().cloned())
            .collect();
        types.into_iter().collect()
    }
}
