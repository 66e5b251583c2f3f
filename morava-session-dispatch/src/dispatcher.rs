use metrics::counter;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use morava_core::delivery::{ConsumerEndpoint, MessageHandle, SessionListener};
use morava_core::message::{Message, MessageId};
use morava_core::wait::WaitCondition;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::config::SessionDispatchConfig;
use crate::coordinator::DispatchCoordinator;
use crate::errors::{Result, SessionDispatchError};
use crate::pending_ack::PendingAckCache;
use crate::session_metrics::{SESSION_DISPATCH_PASSES_TOTAL, SESSION_MESSAGES_OUT_TOTAL};

// Consumer map, pending queue and stop gate share one mutual-exclusion
// domain; the in-flight marker lives in the watch channel and is only
// written while this lock is held.
struct DispatchState {
    consumers: HashMap<u64, Arc<dyn ConsumerEndpoint>>,
    // Ordered, duplicate-free queue of consumers that want dispatch attention
    pending: VecDeque<u64>,
    // Replaced with a fresh token on start(); blocked receives keep the
    // cancelled token they captured and wake from it
    stop: CancellationToken,
}

/// Per-session dispatch engine.
///
/// Owns the registered consumer endpoints and the pending queue, and runs
/// the dispatch pass under the single-flight coordinator, so one session
/// never executes two passes at once while passes of different sessions run
/// in parallel on the shared runtime.
pub struct SessionDispatcher {
    state: Mutex<DispatchState>,
    // Consumer currently inside a delivery attempt; remove_consumer awaits
    // the None transition instead of polling
    in_flight_tx: watch::Sender<Option<u64>>,
    available_tx: mpsc::UnboundedSender<u64>,
    listener: Arc<dyn SessionListener>,
    cache: Arc<Mutex<PendingAckCache>>,
    coordinator: DispatchCoordinator,
    config: SessionDispatchConfig,
}

impl SessionDispatcher {
    pub fn new(
        listener: Arc<dyn SessionListener>,
        cache: Arc<Mutex<PendingAckCache>>,
        config: SessionDispatchConfig,
    ) -> Arc<Self> {
        let (in_flight_tx, _) = watch::channel(None);
        let (available_tx, mut available_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak: &Weak<SessionDispatcher>| {
            let pass_target = weak.clone();
            let coordinator = DispatchCoordinator::spawn(move || {
                let target = pass_target.clone();
                async move {
                    match target.upgrade() {
                        Some(dispatcher) => dispatcher.run_dispatch_pass().await,
                        None => Ok(()),
                    }
                }
            });

            // Relays "message available" events from the endpoints into the
            // pending queue. Exits when the dispatcher (and its sender) is gone.
            let relay_target = weak.clone();
            tokio::spawn(async move {
                while let Some(consumer_id) = available_rx.recv().await {
                    match relay_target.upgrade() {
                        Some(dispatcher) => dispatcher.message_available(consumer_id).await,
                        None => break,
                    }
                }
            });

            SessionDispatcher {
                state: Mutex::new(DispatchState {
                    consumers: HashMap::new(),
                    pending: VecDeque::new(),
                    stop: CancellationToken::new(),
                }),
                in_flight_tx,
                available_tx,
                listener,
                cache,
                coordinator,
                config,
            }
        })
    }

    /// Registers the endpoint and subscribes this dispatcher to its
    /// "message available" notifications.
    pub async fn add_consumer(&self, endpoint: Arc<dyn ConsumerEndpoint>) -> Result<()> {
        let consumer_id = endpoint.id();
        {
            let mut st = self.state.lock().await;
            if st.consumers.contains_key(&consumer_id) {
                return Err(SessionDispatchError::ConsumerAlreadyRegistered(consumer_id));
            }
            st.consumers.insert(consumer_id, endpoint.clone());
        }
        endpoint
            .set_availability_notifier(Some(self.available_tx.clone()))
            .await;
        trace!("Consumer {} registered with session dispatcher", consumer_id);
        Ok(())
    }

    /// Deregisters the consumer, blocking until it is no longer the
    /// in-flight one so a hand-off in progress is never raced.
    pub async fn remove_consumer(&self, consumer_id: u64) -> Result<()> {
        let mut in_flight_rx = self.in_flight_tx.subscribe();
        loop {
            // Mark the current in-flight version as seen before checking, so
            // a transition between the check and the wait is never missed.
            let _ = in_flight_rx.borrow_and_update();
            {
                let mut st = self.state.lock().await;
                if *self.in_flight_tx.borrow() != Some(consumer_id) {
                    let endpoint = st
                        .consumers
                        .remove(&consumer_id)
                        .ok_or(SessionDispatchError::UnknownConsumer(consumer_id))?;
                    st.pending.retain(|id| *id != consumer_id);
                    drop(st);
                    endpoint.set_availability_notifier(None).await;
                    endpoint.set_waiting_for_message(None).await;
                    trace!("Consumer {} removed from session dispatcher", consumer_id);
                    return Ok(());
                }
            }
            if in_flight_rx.changed().await.is_err() {
                return Err(SessionDispatchError::InvalidState(
                    "dispatcher torn down while removing consumer".to_string(),
                ));
            }
        }
    }

    /// Opens the stop gate, re-queues every consumer that already has
    /// messages waiting and triggers a pass.
    pub async fn start(&self) {
        let endpoints: Vec<Arc<dyn ConsumerEndpoint>> = {
            let mut st = self.state.lock().await;
            st.stop = CancellationToken::new();
            st.consumers.values().cloned().collect()
        };
        self.coordinator.resume();
        for endpoint in endpoints {
            if endpoint.message_count().await > 0 {
                self.enqueue_pending(endpoint.id()).await;
            }
        }
        self.coordinator.schedule();
    }

    /// Closes the stop gate. Blocked receives wake via their captured stop
    /// token; an in-flight pass finishes its current single send and exits.
    pub async fn stop(&self) {
        self.coordinator.stop();
        let st = self.state.lock().await;
        st.stop.cancel();
    }

    /// Stops dispatch, deregisters every consumer (waiting out any in-flight
    /// delivery) and releases all delivered-but-unacked messages.
    pub async fn close(&self) -> Result<()> {
        self.stop().await;
        let consumer_ids: Vec<u64> = {
            let st = self.state.lock().await;
            st.consumers.keys().copied().collect()
        };
        for consumer_id in consumer_ids {
            self.remove_consumer(consumer_id).await?;
        }
        self.cache.lock().await.clear().await
    }

    /// Toggles push delivery for one consumer. Enabling it while messages
    /// are already queued makes the consumer eligible for the next pass
    /// immediately.
    pub async fn set_asynchronous(&self, consumer_id: u64, enabled: bool) -> Result<()> {
        let endpoint = self.endpoint(consumer_id).await?;
        endpoint.set_asynchronous(enabled).await;
        if enabled && endpoint.message_count().await > 0 {
            self.message_available(consumer_id).await;
        }
        Ok(())
    }

    /// Entry point for "a message became visible to this consumer".
    pub async fn message_available(&self, consumer_id: u64) {
        self.enqueue_pending(consumer_id).await;
        self.coordinator.schedule();
    }

    pub async fn receive_no_wait(&self, consumer_id: u64) -> Result<Option<Message>> {
        self.receive_with(consumer_id, WaitCondition::Immediate)
            .await
    }

    /// Synchronous receive, bounded by `wait` (zero means wait indefinitely)
    /// and cancelled promptly by `stop`.
    pub async fn receive(&self, consumer_id: u64, wait: Duration) -> Result<Option<Message>> {
        let stop = self.current_stop_token().await;
        let cancel = WaitCondition::for_wait(wait, stop);
        self.receive_with(consumer_id, cancel).await
    }

    /// Non-destructive peek at the leading messages of a browser consumer.
    /// Stops at `count` or as soon as the session is stopped.
    pub async fn browse(&self, consumer_id: u64, count: usize) -> Result<Vec<Message>> {
        let endpoint = self.endpoint(consumer_id).await?;
        if !endpoint.is_browser() {
            return Err(SessionDispatchError::NotABrowser(consumer_id));
        }
        let stop = self.current_stop_token().await;
        let mut messages = Vec::new();
        for cursor in 0..count {
            if stop.is_cancelled() {
                break;
            }
            match endpoint
                .browse_next(cursor)
                .await
                .map_err(SessionDispatchError::from)?
            {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        Ok(messages)
    }

    async fn receive_with(
        &self,
        consumer_id: u64,
        cancel: WaitCondition,
    ) -> Result<Option<Message>> {
        let endpoint = self.endpoint(consumer_id).await?;
        match endpoint
            .receive(cancel.clone())
            .await
            .map_err(SessionDispatchError::from)?
        {
            Some(handle) => {
                if self.is_stopped().await {
                    // Stopped while the handle was being produced: a stopped
                    // session hands nothing out, so the message goes back to
                    // the store for later redelivery.
                    handle
                        .release()
                        .await
                        .map_err(|e| SessionDispatchError::Persistence(e.to_string()))?;
                    return Ok(None);
                }
                self.deliver_to_caller(handle).await.map(Some)
            }
            None => {
                // Let a later asynchronous notification satisfy an
                // equivalent wait.
                endpoint.set_waiting_for_message(Some(cancel)).await;
                Ok(None)
            }
        }
    }

    // Same pre-send sequence as the asynchronous path, but the message is
    // copied to the blocked caller instead of pushed to the listener.
    async fn deliver_to_caller(&self, handle: Arc<dyn MessageHandle>) -> Result<Message> {
        let consumer_id = handle.consumer_id();
        let message_id = handle.message_id();
        {
            let mut cache = self.cache.lock().await;
            if let Err(e) = cache.pre_send(handle.clone()).await {
                // Never entered the cache; put it straight back.
                if let Err(release_err) = handle.release().await {
                    warn!(
                        "Failed to release handle after pre-send failure: {}",
                        release_err
                    );
                }
                return Err(e);
            }
        }
        match handle.message().await {
            Ok(message) => {
                self.cache
                    .lock()
                    .await
                    .post_send(consumer_id, &message_id)
                    .await?;
                counter!(SESSION_MESSAGES_OUT_TOTAL.name).increment(1);
                Ok(message)
            }
            Err(e) => {
                self.release_after_failed_send(consumer_id, &message_id)
                    .await;
                Err(e.into())
            }
        }
    }

    // One pass over the pending queue, bounded by the per-pass message and
    // wall-clock budgets so one session cannot monopolize shared workers.
    // Leftover pending work re-triggers another pass before returning.
    async fn run_dispatch_pass(&self) -> Result<()> {
        counter!(SESSION_DISPATCH_PASSES_TOTAL.name).increment(1);
        let deadline = Instant::now() + self.config.pass_time_budget();
        let mut sent = 0usize;
        loop {
            if sent >= self.config.pass_message_budget || Instant::now() >= deadline {
                let more = {
                    let st = self.state.lock().await;
                    !st.pending.is_empty() && !st.stop.is_cancelled()
                };
                if more {
                    self.coordinator.schedule();
                }
                break;
            }

            let next = {
                let mut st = self.state.lock().await;
                if st.stop.is_cancelled() {
                    None
                } else {
                    let mut found = None;
                    while let Some(id) = st.pending.pop_front() {
                        if let Some(endpoint) = st.consumers.get(&id) {
                            found = Some((id, endpoint.clone()));
                            break;
                        }
                        // Queued consumer was removed in the meantime; skip it.
                    }
                    found
                }
            };
            let Some((consumer_id, endpoint)) = next else {
                break;
            };

            if endpoint.message_count().await == 0 {
                continue;
            }

            if endpoint.is_asynchronous().await {
                self.begin_in_flight(consumer_id).await;
                let outcome = self.attempt_send(&endpoint).await;
                // Cleared on every outcome; remove_consumer callers wake here.
                self.end_in_flight().await;
                match outcome {
                    Ok(true) => {
                        sent += 1;
                        if endpoint.message_count().await > 0 {
                            self.enqueue_pending(consumer_id).await;
                        }
                    }
                    Ok(false) => {
                        // Transient: nothing delivered, the message was
                        // released and will come back via a new notification.
                    }
                    Err(e) => {
                        warn!("Send attempt to consumer {} failed: {}", consumer_id, e);
                    }
                }
            } else if endpoint.is_waiting_for_message().await {
                // A caller is blocked in receive; it consumes the message
                // itself, we only signal availability.
                if let Err(e) = self.listener.on_message_available().await {
                    warn!("Message-available notification failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// One push attempt to the remote listener. Ok(true) when the listener
    /// accepted the message; Ok(false) when no message was eligible or the
    /// hand-off was not accepted, in which case the handle was released for
    /// redelivery.
    async fn attempt_send(&self, endpoint: &Arc<dyn ConsumerEndpoint>) -> Result<bool> {
        let Some(handle) = endpoint
            .receive(WaitCondition::Immediate)
            .await
            .map_err(SessionDispatchError::from)?
        else {
            return Ok(false);
        };
        let consumer_id = handle.consumer_id();
        let message_id = handle.message_id();

        {
            let mut cache = self.cache.lock().await;
            if let Err(e) = cache.pre_send(handle.clone()).await {
                if let Err(release_err) = handle.release().await {
                    warn!(
                        "Failed to release handle after pre-send failure: {}",
                        release_err
                    );
                }
                return Err(e);
            }
        }

        let message = match handle.message().await {
            Ok(message) => message,
            Err(e) => {
                self.release_after_failed_send(consumer_id, &message_id)
                    .await;
                return Err(e.into());
            }
        };

        // Bounded hand-off: a slow remote listener counts as not delivered
        // rather than stalling the session serialization.
        let delivered = match timeout(
            self.config.handoff_timeout(),
            self.listener.on_message(message),
        )
        .await
        {
            Ok(Ok(delivered)) => delivered,
            Ok(Err(e)) => {
                warn!("Listener hand-off failed for consumer {}: {}", consumer_id, e);
                false
            }
            Err(_) => {
                warn!("Listener hand-off timed out for consumer {}", consumer_id);
                false
            }
        };

        if delivered {
            self.cache
                .lock()
                .await
                .post_send(consumer_id, &message_id)
                .await?;
            counter!(SESSION_MESSAGES_OUT_TOTAL.name).increment(1);
            trace!("Message {} dispatched to consumer {}", message_id, consumer_id);
            Ok(true)
        } else {
            self.release_after_failed_send(consumer_id, &message_id)
                .await;
            Ok(false)
        }
    }

    // The delivered flag already committed, so the release runs as its own
    // compensating unit of work.
    async fn release_after_failed_send(&self, consumer_id: u64, message_id: &MessageId) {
        let mut cache = self.cache.lock().await;
        if let Err(e) = cache.release_undelivered(consumer_id, message_id).await {
            warn!(
                "Failed to release message {} for consumer {} after failed hand-off: {}",
                message_id, consumer_id, e
            );
        }
    }

    async fn begin_in_flight(&self, consumer_id: u64) {
        let _st = self.state.lock().await;
        self.in_flight_tx.send_replace(Some(consumer_id));
    }

    async fn end_in_flight(&self) {
        let _st = self.state.lock().await;
        self.in_flight_tx.send_replace(None);
    }

    async fn enqueue_pending(&self, consumer_id: u64) {
        let mut st = self.state.lock().await;
        if st.stop.is_cancelled() || !st.consumers.contains_key(&consumer_id) {
            return;
        }
        if !st.pending.contains(&consumer_id) {
            st.pending.push_back(consumer_id);
        }
    }

    async fn endpoint(&self, consumer_id: u64) -> Result<Arc<dyn ConsumerEndpoint>> {
        self.state
            .lock()
            .await
            .consumers
            .get(&consumer_id)
            .cloned()
            .ok_or(SessionDispatchError::UnknownConsumer(consumer_id))
    }

    pub(crate) async fn current_stop_token(&self) -> CancellationToken {
        self.state.lock().await.stop.clone()
    }

    async fn is_stopped(&self) -> bool {
        self.state.lock().await.stop.is_cancelled()
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod dispatcher_test;
