use thiserror::Error;

/// Faults raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row that cannot be mapped back onto the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the reservation engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("seat {seat_id} is not available")]
    SeatUnavailable { seat_id: i64 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transaction failed: {0}")]
    TransactionFailure(String),

    #[error("payment gateway error: {0}")]
    PaymentGateway(String),
}

/// What the caller should make of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    BadRequest,
    Forbidden,
    /// The resource lost a race or is in the wrong state; the caller may retry.
    ConflictRetry,
    BadGateway,
    Internal,
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::Validation(_) => ErrorClass::BadRequest,
            EngineError::Unauthorized(_) => ErrorClass::Forbidden,
            EngineError::Conflict(_) | EngineError::SeatUnavailable { .. } => ErrorClass::ConflictRetry,
            EngineError::PaymentGateway(_) => ErrorClass::BadGateway,
            EngineError::TransactionFailure(_) => ErrorClass::Internal,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::TransactionFailure(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_faults_become_transaction_failures() {
        let err: EngineError = StoreError::Backend("connection reset".into()).into();
        assert!(matches!(err, EngineError::TransactionFailure(ref m) if m.contains("connection reset")));
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    #[test]
    fn race_losers_are_retryable_conflicts() {
        assert_eq!(EngineError::SeatUnavailable { seat_id: 7 }.class(), ErrorClass::ConflictRetry);
        assert_eq!(EngineError::Conflict("already cancelled".into()).class(), ErrorClass::ConflictRetry);
        assert_eq!(EngineError::Unauthorized("not yours".into()).class(), ErrorClass::Forbidden);
        assert_eq!(EngineError::Validation("seat_id".into()).class(), ErrorClass::BadRequest);
    }
}
