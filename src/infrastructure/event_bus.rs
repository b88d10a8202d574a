use crate::domain::events::PaymentEvent;
use crate::domain::ports::EventBus;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Receives published payment events. Processor plugins implement this to
/// attach reconciliation results or submit charge batches.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &mut PaymentEvent) -> Result<()>;
}

/// Fans each event out to every subscriber, in registration order, before returning.
#[derive(Default, Clone)]
pub struct InProcessEventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribe(subscriber);
        self
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: &mut PaymentEvent) -> Result<()> {
        debug!(
            event = event.name(),
            processor = %event.processor_type(),
            subscribers = self.subscribers.len(),
            "publishing payment event"
        );
        for subscriber in &self.subscribers {
            subscriber.on_event(event).await?;
        }
        Ok(())
    }
}
