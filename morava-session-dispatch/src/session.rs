use std::sync::Arc;
use std::time::Duration;

use morava_core::delivery::{ConsumerEndpoint, MessagePublisher, SessionListener};
use morava_core::message::{AckMode, Message, MessageId};
use morava_core::persistence::UnitOfWork;
use morava_core::transaction::{BranchId, PrepareVote, ResourceManager};
use tokio::sync::Mutex;

use crate::config::SessionDispatchConfig;
use crate::dispatcher::SessionDispatcher;
use crate::errors::Result;
use crate::pending_ack::PendingAckCache;
use crate::transaction::SessionTransactionCoordinator;

/// One client session: the dispatch engine, the pending-ack cache and the
/// transaction coordinator wired together behind the surface the wire layer
/// calls.
///
/// All collaborators are injected at construction; a session owns its parts
/// and nothing process-wide.
pub struct Session {
    ack_mode: AckMode,
    dispatcher: Arc<SessionDispatcher>,
    cache: Arc<Mutex<PendingAckCache>>,
    transactions: SessionTransactionCoordinator,
    // Whether dispatch was running before the current operation; recover and
    // rollback only restart a session that was running
    running: Mutex<bool>,
}

impl Session {
    pub fn new(
        ack_mode: AckMode,
        listener: Arc<dyn SessionListener>,
        uow: Arc<dyn UnitOfWork>,
        resource_manager: Arc<dyn ResourceManager>,
        publisher: Arc<dyn MessagePublisher>,
        config: SessionDispatchConfig,
    ) -> Self {
        let cache = Arc::new(Mutex::new(PendingAckCache::new(ack_mode, uow)));
        let dispatcher = SessionDispatcher::new(listener, cache.clone(), config);
        Self {
            ack_mode,
            dispatcher,
            cache,
            transactions: SessionTransactionCoordinator::new(resource_manager, publisher),
            running: Mutex::new(true),
        }
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    // -- consumer lifecycle

    pub async fn add_consumer(&self, endpoint: Arc<dyn ConsumerEndpoint>) -> Result<()> {
        self.dispatcher.add_consumer(endpoint).await
    }

    pub async fn remove_consumer(&self, consumer_id: u64) -> Result<()> {
        self.dispatcher.remove_consumer(consumer_id).await
    }

    pub async fn set_asynchronous(&self, consumer_id: u64, enabled: bool) -> Result<()> {
        self.dispatcher.set_asynchronous(consumer_id, enabled).await
    }

    pub async fn message_available(&self, consumer_id: u64) {
        self.dispatcher.message_available(consumer_id).await;
    }

    // -- delivery

    pub async fn receive_no_wait(&self, consumer_id: u64) -> Result<Option<Message>> {
        self.dispatcher.receive_no_wait(consumer_id).await
    }

    pub async fn receive(&self, consumer_id: u64, wait: Duration) -> Result<Option<Message>> {
        self.dispatcher.receive(consumer_id, wait).await
    }

    pub async fn browse(&self, consumer_id: u64, count: usize) -> Result<Vec<Message>> {
        self.dispatcher.browse(consumer_id, count).await
    }

    /// Cumulative acknowledgment of everything delivered at or before the
    /// matched message, across all of the session's consumers.
    pub async fn acknowledge(&self, consumer_id: u64, message_id: &MessageId) -> Result<()> {
        self.cache
            .lock()
            .await
            .acknowledge(consumer_id, message_id)
            .await
    }

    /// Publishes the message, or redirects it into the transactional log
    /// while a branch is associated.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.transactions.send(message).await
    }

    // -- session lifecycle

    pub async fn start(&self) {
        *self.running.lock().await = true;
        self.dispatcher.start().await;
    }

    pub async fn stop(&self) {
        *self.running.lock().await = false;
        self.dispatcher.stop().await;
    }

    pub async fn close(&self) -> Result<()> {
        *self.running.lock().await = false;
        self.dispatcher.close().await
    }

    /// Local commit: every delivered-but-unacked message becomes permanently
    /// acknowledged.
    pub async fn commit(&self) -> Result<()> {
        self.cache.lock().await.acknowledge_all().await
    }

    /// Local rollback: every delivered-but-unacked message becomes
    /// redeliverable, marked as redelivered on the next hand-off.
    pub async fn rollback(&self) -> Result<()> {
        self.redeliver_outstanding().await
    }

    /// Same redelivery semantics as rollback, for non-transacted sessions.
    pub async fn recover(&self) -> Result<()> {
        self.redeliver_outstanding().await
    }

    // Dispatch is quiesced around the cache clear so no pass observes the
    // cache mid-drain; a session that was stopped stays stopped.
    async fn redeliver_outstanding(&self) -> Result<()> {
        let was_running = *self.running.lock().await;
        self.dispatcher.stop().await;
        let result = self.cache.lock().await.clear().await;
        if was_running {
            self.dispatcher.start().await;
        }
        result
    }

    // -- transaction branch passthrough

    pub async fn start_branch(&self, branch: BranchId) -> Result<()> {
        self.transactions.start_branch(branch).await
    }

    pub async fn end_branch(&self, branch: &BranchId) -> Result<()> {
        self.transactions.end_branch(branch).await
    }

    pub async fn prepare_branch(&self, branch: &BranchId) -> Result<PrepareVote> {
        self.transactions.prepare_branch(branch).await
    }

    pub async fn commit_branch(&self, branch: &BranchId, one_phase: bool) -> Result<()> {
        self.transactions.commit_branch(branch, one_phase).await
    }

    pub async fn rollback_branch(&self, branch: &BranchId) -> Result<()> {
        self.transactions.rollback_branch(branch).await
    }

    pub async fn forget_branch(&self, branch: &BranchId) -> Result<()> {
        self.transactions.forget_branch(branch).await
    }

    pub async fn recover_branches(&self, flags: u32) -> Result<Vec<BranchId>> {
        self.transactions.recover_branches(flags).await
    }

    pub async fn transaction_timeout(&self) -> Result<u32> {
        self.transactions.transaction_timeout().await
    }

    pub async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool> {
        self.transactions.set_transaction_timeout(seconds).await
    }

    pub async fn associated_branch(&self) -> Option<BranchId> {
        self.transactions.associated_branch().await
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> Arc<Mutex<PendingAckCache>> {
        self.cache.clone()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
