use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::errors::Result;
use crate::message::Message;

/// Identifies one branch of a distributed (two-phase) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(pub String);

impl Display for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of the prepare phase for a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// The branch has work to commit.
    Ok,
    /// The branch performed no updates; the second phase can be skipped.
    ReadOnly,
}

/// Branch operations of the external resource manager.
///
/// The session only tracks which branch it is currently inside; the actual
/// two-phase protocol runs here.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn start(&self, branch: &BranchId) -> Result<()>;

    async fn end(&self, branch: &BranchId) -> Result<()>;

    async fn prepare(&self, branch: &BranchId) -> Result<PrepareVote>;

    async fn commit(&self, branch: &BranchId, one_phase: bool) -> Result<()>;

    async fn rollback(&self, branch: &BranchId) -> Result<()>;

    async fn forget(&self, branch: &BranchId) -> Result<()>;

    /// Returns the branches in doubt, filtered by the caller's scan flags.
    async fn recover(&self, flags: u32) -> Result<Vec<BranchId>>;

    async fn transaction_timeout(&self) -> Result<u32>;

    async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool>;

    /// Records an in-branch send in the transactional log instead of making
    /// it immediately visible. The message becomes visible when the branch
    /// commits.
    async fn log_send(&self, branch: &BranchId, message: Message) -> Result<()>;
}
