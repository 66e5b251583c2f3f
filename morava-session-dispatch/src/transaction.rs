use std::sync::Arc;

use morava_core::delivery::MessagePublisher;
use morava_core::message::Message;
use morava_core::transaction::{BranchId, PrepareVote, ResourceManager};
use tokio::sync::Mutex;
use tracing::trace;

use crate::errors::{Result, SessionDispatchError};

/// Tracks the transaction branch a session is currently inside and routes
/// sends accordingly.
///
/// While a branch is associated, ordinary sends go to the resource manager's
/// transactional log instead of the immediate-visibility publish path. The
/// association is cleared by commit, rollback, end and forget whether or not
/// the delegated operation succeeds: an association left dangling would
/// misroute every subsequent send.
pub struct SessionTransactionCoordinator {
    branch: Mutex<Option<BranchId>>,
    resource_manager: Arc<dyn ResourceManager>,
    publisher: Arc<dyn MessagePublisher>,
}

impl SessionTransactionCoordinator {
    pub fn new(
        resource_manager: Arc<dyn ResourceManager>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            branch: Mutex::new(None),
            resource_manager,
            publisher,
        }
    }

    /// Publishes immediately, or redirects into transactional logging while
    /// a branch is associated.
    pub async fn send(&self, message: Message) -> Result<()> {
        let associated = self.branch.lock().await.clone();
        match associated {
            Some(branch) => {
                trace!("Send redirected into transaction branch {}", branch);
                Ok(self.resource_manager.log_send(&branch, message).await?)
            }
            None => Ok(self.publisher.publish(message).await?),
        }
    }

    pub async fn associated_branch(&self) -> Option<BranchId> {
        self.branch.lock().await.clone()
    }

    /// Associates the session with a branch. At most one branch can be
    /// associated at a time.
    pub async fn start_branch(&self, branch: BranchId) -> Result<()> {
        let mut slot = self.branch.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Err(SessionDispatchError::BranchAlreadyAssociated(
                existing.to_string(),
            ));
        }
        self.resource_manager.start(&branch).await?;
        *slot = Some(branch);
        Ok(())
    }

    pub async fn end_branch(&self, branch: &BranchId) -> Result<()> {
        let result = self.resource_manager.end(branch).await;
        self.clear_if_associated(branch).await;
        Ok(result?)
    }

    /// Prepare leaves the association in place; only the outcome operations
    /// clear it.
    pub async fn prepare_branch(&self, branch: &BranchId) -> Result<PrepareVote> {
        Ok(self.resource_manager.prepare(branch).await?)
    }

    pub async fn commit_branch(&self, branch: &BranchId, one_phase: bool) -> Result<()> {
        let result = self.resource_manager.commit(branch, one_phase).await;
        self.clear_if_associated(branch).await;
        Ok(result?)
    }

    pub async fn rollback_branch(&self, branch: &BranchId) -> Result<()> {
        let result = self.resource_manager.rollback(branch).await;
        self.clear_if_associated(branch).await;
        Ok(result?)
    }

    pub async fn forget_branch(&self, branch: &BranchId) -> Result<()> {
        let result = self.resource_manager.forget(branch).await;
        self.clear_if_associated(branch).await;
        Ok(result?)
    }

    pub async fn recover_branches(&self, flags: u32) -> Result<Vec<BranchId>> {
        Ok(self.resource_manager.recover(flags).await?)
    }

    pub async fn transaction_timeout(&self) -> Result<u32> {
        Ok(self.resource_manager.transaction_timeout().await?)
    }

    pub async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool> {
        Ok(self.resource_manager.set_transaction_timeout(seconds).await?)
    }

    async fn clear_if_associated(&self, branch: &BranchId) {
        let mut slot = self.branch.lock().await;
        if slot.as_ref() == Some(branch) {
            *slot = None;
        }
    }
}

#[cfg(test)]
#[path = "transaction_test.rs"]
mod transaction_test;
