use async_trait::async_trait;

use crate::errors::Result;

/// Transaction boundaries of the persistence layer backing delivered flags
/// and acknowledgments.
///
/// A unit of work brackets exactly the mutating calls into the pending-ack
/// cache; it never spans a network hand-off to the remote listener.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    fn is_transacted(&self) -> bool;
}
