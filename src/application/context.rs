use crate::domain::ports::SharedClock;
use crate::infrastructure::clock::SystemClock;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

/// Per-invocation context handed to every service.
///
/// Built fresh for each run; nothing in the core reads time or settings from
/// process-wide state.
#[derive(Clone)]
pub struct RunContext {
    clock: SharedClock,
}

impl RunContext {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    pub fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::system()
    }
}
