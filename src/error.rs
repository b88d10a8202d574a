use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum PaymentError {
    #[error("CSV error: {0}")]
    #[diagnostic(code(paycycle::csv))]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(paycycle::io))]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(paycycle::serialization))]
    SerializationError(#[from] serde_json::Error),

    /// Rejected input; nothing was written.
    #[error("Validation error: {0}")]
    #[diagnostic(code(paycycle::validation))]
    ValidationError(String),

    #[error("{entity} {id} not found")]
    #[diagnostic(code(paycycle::not_found))]
    NotFound { entity: &'static str, id: String },

    /// A processor plugin failed while handling an event. Retryable.
    #[error("Handler error: {0}")]
    #[diagnostic(code(paycycle::handler))]
    HandlerError(String),

    #[error("Storage error: {0}")]
    #[diagnostic(code(paycycle::storage))]
    StorageError(String),

    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    #[diagnostic(code(paycycle::rocksdb))]
    RocksDbError(#[from] rocksdb::Error),
}

impl PaymentError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_carries_context() {
        let err = PaymentError::not_found("contribution", 42);
        assert_eq!(err.to_string(), "contribution 42 not found");
        assert!(matches!(
            err,
            PaymentError::NotFound { entity: "contribution", ref id } if id == "42"
        ));
    }
}
