use crate::error::PaymentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a family of payment processors (e.g. `stripe`, `gocardless`).
///
/// Routing key for queues, handlers and payability providers. Always stored
/// trimmed and lowercase so `Stripe` and `stripe` land on the same queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcessorType(String);

impl ProcessorType {
    pub fn new(name: impl AsRef<str>) -> Result<Self, PaymentError> {
        let name = name.as_ref().trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(PaymentError::ValidationError(
                "Processor type cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(PaymentError::ValidationError(format!(
                "Processor type '{name}' contains invalid characters"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProcessorType {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProcessorType {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProcessorType> for String {
    fn from(value: ProcessorType) -> Self {
        value.0
    }
}
