use morava_core::errors::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionDispatchError>;

#[derive(Debug, Error)]
pub enum SessionDispatchError {
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(u64),

    #[error("Consumer already registered: {0}")]
    ConsumerAlreadyRegistered(u64),

    #[error("Consumer {0} is not a browser")]
    NotABrowser(u64),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Transaction branch already associated: {0}")]
    BranchAlreadyAssociated(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<CoreError> for SessionDispatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Storage(msg) => SessionDispatchError::Persistence(msg),
            CoreError::Delivery(msg) => SessionDispatchError::Delivery(msg),
            CoreError::Transaction(msg) => SessionDispatchError::InvalidState(msg),
            CoreError::HandleGone(msg) => SessionDispatchError::Delivery(msg),
        }
    }
}
