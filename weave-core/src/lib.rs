pub mod documents;
pub mod events;
pub mod identity;
pub mod lock;
pub mod orders;
pub mod payment;
pub mod repository;
pub mod tracking;
pub mod transaction;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Concurrent modification: {0}")]
    Conflict(String),
    #[error("Payment gateway error: {0}")]
    GatewayError(String),
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),
    #[error("Lock backend error: {0}")]
    LockError(String),
    #[error("Event publish failed: {0}")]
    PublishError(String),
    #[error("Document service error: {0}")]
    DocumentError(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
