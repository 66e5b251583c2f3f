//! In-memory mock collaborators shared by the unit tests: a per-consumer
//! message store with handle bookkeeping, a poll/park consumer endpoint, a
//! programmable remote listener, and recording persistence/transaction
//! doubles.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use morava_core::delivery::{ConsumerEndpoint, MessageHandle, MessagePublisher, SessionListener};
use morava_core::errors::{CoreError, Result as CoreResult};
use morava_core::message::{AckMode, Message, MessageId};
use morava_core::persistence::UnitOfWork;
use morava_core::transaction::{BranchId, PrepareVote, ResourceManager};
use morava_core::wait::WaitCondition;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};

use crate::config::SessionDispatchConfig;
use crate::session::Session;

pub(crate) fn make_message(producer_id: u64, sequence: u64) -> Message {
    Message {
        msg_id: MessageId {
            producer_id,
            sequence,
        },
        payload: format!("payload-{}-{}", producer_id, sequence).into_bytes(),
        publish_time: 0,
        producer_name: "producer-test".to_string(),
        destination_name: "/default/orders".to_string(),
        redelivered: false,
        attributes: HashMap::new(),
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Polls `probe` until it reports true or `wait` elapses.
pub(crate) async fn wait_until<F, Fut>(mut probe: F, wait: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + wait;
    loop {
        if probe().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

// -- message store ---------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    queues: HashMap<u64, VecDeque<Message>>,
    destroyed: Vec<MessageId>,
    released: Vec<MessageId>,
}

/// Per-consumer FIFO store standing in for the durable message store.
/// Released handles go back to the front of their queue with the
/// redelivered flag set, the way the real store re-offers them.
pub(crate) struct InMemoryStore {
    inner: Mutex<StoreInner>,
    pub(crate) fail_set_delivered: AtomicBool,
    pub(crate) fail_destroy: AtomicBool,
}

impl InMemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner::default()),
            fail_set_delivered: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
        })
    }

    pub(crate) async fn push(&self, consumer_id: u64, message: Message) {
        self.inner
            .lock()
            .await
            .queues
            .entry(consumer_id)
            .or_default()
            .push_back(message);
    }

    pub(crate) async fn queue_len(&self, consumer_id: u64) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(&consumer_id)
            .map_or(0, |q| q.len())
    }

    pub(crate) async fn peek(&self, consumer_id: u64, cursor: usize) -> Option<Message> {
        self.inner
            .lock()
            .await
            .queues
            .get(&consumer_id)
            .and_then(|q| q.get(cursor).cloned())
    }

    pub(crate) async fn destroyed(&self) -> Vec<MessageId> {
        self.inner.lock().await.destroyed.clone()
    }

    pub(crate) async fn released(&self) -> Vec<MessageId> {
        self.inner.lock().await.released.clone()
    }

    async fn pop(&self, consumer_id: u64) -> Option<Message> {
        self.inner
            .lock()
            .await
            .queues
            .get_mut(&consumer_id)
            .and_then(|q| q.pop_front())
    }

    async fn requeue_front(&self, consumer_id: u64, mut message: Message) {
        message.redelivered = true;
        let mut inner = self.inner.lock().await;
        inner.released.push(message.msg_id.clone());
        inner
            .queues
            .entry(consumer_id)
            .or_default()
            .push_front(message);
    }

    async fn record_destroyed(&self, message_id: MessageId) {
        self.inner.lock().await.destroyed.push(message_id);
    }
}

pub(crate) struct StoreHandle {
    store: Arc<InMemoryStore>,
    consumer_id: u64,
    message: Message,
    delivered: AtomicBool,
}

impl StoreHandle {
    pub(crate) fn new(store: Arc<InMemoryStore>, consumer_id: u64, message: Message) -> Arc<Self> {
        Arc::new(Self {
            store,
            consumer_id,
            message,
            delivered: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessageHandle for StoreHandle {
    fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    fn message_id(&self) -> MessageId {
        self.message.msg_id.clone()
    }

    async fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    async fn set_delivered(&self, delivered: bool) -> CoreResult<()> {
        if self.store.fail_set_delivered.load(Ordering::Acquire) {
            return Err(CoreError::Storage(
                "injected set-delivered failure".to_string(),
            ));
        }
        self.delivered.store(delivered, Ordering::Release);
        Ok(())
    }

    async fn message(&self) -> CoreResult<Message> {
        Ok(self.message.clone())
    }

    async fn release(&self) -> CoreResult<()> {
        self.store
            .requeue_front(self.consumer_id, self.message.clone())
            .await;
        Ok(())
    }

    async fn destroy(&self) -> CoreResult<()> {
        if self.store.fail_destroy.load(Ordering::Acquire) {
            return Err(CoreError::Storage("injected destroy failure".to_string()));
        }
        self.store.record_destroyed(self.message.msg_id.clone()).await;
        Ok(())
    }
}

// -- consumer endpoint -----------------------------------------------------

pub(crate) struct MockEndpoint {
    id: u64,
    store: Arc<InMemoryStore>,
    asynchronous: AtomicBool,
    browser: bool,
    waiting: Mutex<Option<WaitCondition>>,
    notifier: Mutex<Option<mpsc::UnboundedSender<u64>>>,
}

impl MockEndpoint {
    pub(crate) fn new(id: u64, store: Arc<InMemoryStore>, asynchronous: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            store,
            asynchronous: AtomicBool::new(asynchronous),
            browser: false,
            waiting: Mutex::new(None),
            notifier: Mutex::new(None),
        })
    }

    pub(crate) fn new_browser(id: u64, store: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            id,
            store,
            asynchronous: AtomicBool::new(false),
            browser: true,
            waiting: Mutex::new(None),
            notifier: Mutex::new(None),
        })
    }

    /// Publishes straight into this consumer's queue and raises the
    /// availability signal, the way the routing layer would.
    pub(crate) async fn publish(&self, message: Message) {
        self.store.push(self.id, message).await;
        self.notify_available().await;
    }

    pub(crate) async fn notify_available(&self) {
        if let Some(tx) = self.notifier.lock().await.as_ref() {
            let _ = tx.send(self.id);
        }
    }
}

#[async_trait]
impl ConsumerEndpoint for MockEndpoint {
    fn id(&self) -> u64 {
        self.id
    }

    async fn message_count(&self) -> usize {
        self.store.queue_len(self.id).await
    }

    async fn is_asynchronous(&self) -> bool {
        self.asynchronous.load(Ordering::Acquire)
    }

    async fn set_asynchronous(&self, enabled: bool) {
        self.asynchronous.store(enabled, Ordering::Release);
    }

    fn is_browser(&self) -> bool {
        self.browser
    }

    async fn is_waiting_for_message(&self) -> bool {
        self.waiting.lock().await.is_some()
    }

    async fn set_waiting_for_message(&self, condition: Option<WaitCondition>) {
        *self.waiting.lock().await = condition;
    }

    async fn set_availability_notifier(&self, notifier: Option<mpsc::UnboundedSender<u64>>) {
        *self.notifier.lock().await = notifier;
    }

    async fn receive(&self, cancel: WaitCondition) -> CoreResult<Option<Arc<dyn MessageHandle>>> {
        // Bounded poll/park loop: the queue is checked before the condition
        // so a non-blocking receive still picks up an already-queued message.
        loop {
            if let Some(message) = self.store.pop(self.id).await {
                *self.waiting.lock().await = None;
                return Ok(Some(
                    StoreHandle::new(self.store.clone(), self.id, message)
                        as Arc<dyn MessageHandle>,
                ));
            }
            if cancel.is_satisfied() {
                return Ok(None);
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    async fn browse_next(&self, cursor: usize) -> CoreResult<Option<Message>> {
        Ok(self.store.peek(self.id, cursor).await)
    }
}

// -- remote listener -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandoffOutcome {
    Delivered,
    NotDelivered,
    Hang,
}

pub(crate) struct RecordingListener {
    outcome: Mutex<HandoffOutcome>,
    delivered: Mutex<Vec<Message>>,
    attempts: AtomicU64,
    available: AtomicU64,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(HandoffOutcome::Delivered),
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
            available: AtomicU64::new(0),
        })
    }

    pub(crate) async fn set_outcome(&self, outcome: HandoffOutcome) {
        *self.outcome.lock().await = outcome;
    }

    pub(crate) async fn delivered(&self) -> Vec<Message> {
        self.delivered.lock().await.clone()
    }

    pub(crate) async fn delivered_count(&self) -> usize {
        self.delivered.lock().await.len()
    }

    pub(crate) fn available_notifications(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    /// Number of on_message hand-offs started, whatever their outcome.
    pub(crate) fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SessionListener for RecordingListener {
    async fn on_message(&self, message: Message) -> CoreResult<bool> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let outcome = *self.outcome.lock().await;
        match outcome {
            HandoffOutcome::Delivered => {
                self.delivered.lock().await.push(message);
                Ok(true)
            }
            HandoffOutcome::NotDelivered => Ok(false),
            HandoffOutcome::Hang => {
                sleep(Duration::from_secs(3600)).await;
                Ok(false)
            }
        }
    }

    async fn on_message_available(&self) -> CoreResult<()> {
        self.available.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// -- persistence unit of work ----------------------------------------------

pub(crate) struct MockUnitOfWork {
    pub(crate) begins: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) rollbacks: AtomicU64,
    pub(crate) fail_commit: AtomicBool,
}

impl MockUnitOfWork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            begins: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            fail_commit: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl UnitOfWork for MockUnitOfWork {
    async fn begin(&self) -> CoreResult<()> {
        self.begins.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn commit(&self) -> CoreResult<()> {
        if self.fail_commit.load(Ordering::Acquire) {
            return Err(CoreError::Storage("injected commit failure".to_string()));
        }
        self.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn rollback(&self) -> CoreResult<()> {
        self.rollbacks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_transacted(&self) -> bool {
        true
    }
}

// -- resource manager and publisher ----------------------------------------

pub(crate) struct MockResourceManager {
    pub(crate) started: Mutex<Vec<BranchId>>,
    pub(crate) ended: Mutex<Vec<BranchId>>,
    pub(crate) committed: Mutex<Vec<BranchId>>,
    pub(crate) rolled_back: Mutex<Vec<BranchId>>,
    pub(crate) forgotten: Mutex<Vec<BranchId>>,
    logged: Mutex<HashMap<BranchId, Vec<Message>>>,
    visible: Arc<Mutex<Vec<Message>>>,
    pub(crate) fail_end: AtomicBool,
}

impl MockResourceManager {
    pub(crate) fn new(visible: Arc<Mutex<Vec<Message>>>) -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(Vec::new()),
            forgotten: Mutex::new(Vec::new()),
            logged: Mutex::new(HashMap::new()),
            visible,
            fail_end: AtomicBool::new(false),
        })
    }

    pub(crate) async fn logged_for(&self, branch: &BranchId) -> Vec<Message> {
        self.logged
            .lock()
            .await
            .get(branch)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn start(&self, branch: &BranchId) -> CoreResult<()> {
        self.started.lock().await.push(branch.clone());
        Ok(())
    }

    async fn end(&self, branch: &BranchId) -> CoreResult<()> {
        if self.fail_end.load(Ordering::Acquire) {
            return Err(CoreError::Transaction("injected end failure".to_string()));
        }
        self.ended.lock().await.push(branch.clone());
        Ok(())
    }

    async fn prepare(&self, _branch: &BranchId) -> CoreResult<PrepareVote> {
        Ok(PrepareVote::Ok)
    }

    async fn commit(&self, branch: &BranchId, _one_phase: bool) -> CoreResult<()> {
        let flushed = self.logged.lock().await.remove(branch).unwrap_or_default();
        self.visible.lock().await.extend(flushed);
        self.committed.lock().await.push(branch.clone());
        Ok(())
    }

    async fn rollback(&self, branch: &BranchId) -> CoreResult<()> {
        self.logged.lock().await.remove(branch);
        self.rolled_back.lock().await.push(branch.clone());
        Ok(())
    }

    async fn forget(&self, branch: &BranchId) -> CoreResult<()> {
        self.forgotten.lock().await.push(branch.clone());
        Ok(())
    }

    async fn recover(&self, _flags: u32) -> CoreResult<Vec<BranchId>> {
        Ok(self.logged.lock().await.keys().cloned().collect())
    }

    async fn transaction_timeout(&self) -> CoreResult<u32> {
        Ok(0)
    }

    async fn set_transaction_timeout(&self, _seconds: u32) -> CoreResult<bool> {
        Ok(true)
    }

    async fn log_send(&self, branch: &BranchId, message: Message) -> CoreResult<()> {
        self.logged
            .lock()
            .await
            .entry(branch.clone())
            .or_default()
            .push(message);
        Ok(())
    }
}

pub(crate) struct VisiblePublisher {
    visible: Arc<Mutex<Vec<Message>>>,
}

impl VisiblePublisher {
    pub(crate) fn new(visible: Arc<Mutex<Vec<Message>>>) -> Arc<Self> {
        Arc::new(Self { visible })
    }
}

#[async_trait]
impl MessagePublisher for VisiblePublisher {
    async fn publish(&self, message: Message) -> CoreResult<()> {
        self.visible.lock().await.push(message);
        Ok(())
    }
}

// -- session fixture -------------------------------------------------------

pub(crate) struct SessionFixture {
    pub(crate) session: Session,
    pub(crate) store: Arc<InMemoryStore>,
    pub(crate) listener: Arc<RecordingListener>,
    pub(crate) uow: Arc<MockUnitOfWork>,
    pub(crate) resource_manager: Arc<MockResourceManager>,
    pub(crate) visible: Arc<Mutex<Vec<Message>>>,
}

pub(crate) fn session_fixture(ack_mode: AckMode) -> SessionFixture {
    session_fixture_with_config(ack_mode, SessionDispatchConfig::default())
}

pub(crate) fn session_fixture_with_config(
    ack_mode: AckMode,
    config: SessionDispatchConfig,
) -> SessionFixture {
    let store = InMemoryStore::new();
    let listener = RecordingListener::new();
    let uow = MockUnitOfWork::new();
    let visible = Arc::new(Mutex::new(Vec::new()));
    let resource_manager = MockResourceManager::new(visible.clone());
    let publisher = VisiblePublisher::new(visible.clone());
    let session = Session::new(
        ack_mode,
        listener.clone(),
        uow.clone(),
        resource_manager.clone(),
        publisher,
        config,
    );
    SessionFixture {
        session,
        store,
        listener,
        uow,
        resource_manager,
        visible,
    }
}
