mod config;
mod coordinator;
mod dispatcher;
mod errors;
mod pending_ack;
mod session;
mod session_metrics;
mod transaction;

#[cfg(test)]
mod test_support;

pub use config::SessionDispatchConfig;
pub use coordinator::DispatchCoordinator;
pub use dispatcher::SessionDispatcher;
pub use errors::{Result, SessionDispatchError};
pub use pending_ack::PendingAckCache;
pub use session::Session;
pub use session_metrics::register_metrics;
pub use transaction::SessionTransactionCoordinator;
