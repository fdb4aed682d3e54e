use thiserror::Error;
use uuid::Uuid;

/// Failure handing a leader notice to the delivery channel.
#[derive(Debug, Error)]
#[error("delivery of escalation {escalation_id} failed: {reason}")]
pub struct DeliveryError {
    pub escalation_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("escalation state for member {0} changed concurrently")]
    Conflict(Uuid),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Storage(err.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
