use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Message handle no longer available: {0}")]
    HandleGone(String),
}
