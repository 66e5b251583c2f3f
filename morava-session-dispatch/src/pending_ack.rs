use metrics::counter;
use std::collections::VecDeque;
use std::sync::Arc;

use morava_core::delivery::MessageHandle;
use morava_core::message::{AckMode, MessageId};
use morava_core::persistence::UnitOfWork;
use tracing::{trace, warn};

use crate::errors::{Result, SessionDispatchError};
use crate::session_metrics::{SESSION_ACKS_TOTAL, SESSION_REDELIVERIES_TOTAL};

/// Ordered collection of message handles that have been delivered to the
/// session but not yet acknowledged.
///
/// Handles are kept in delivery order across all consumers sharing the
/// session, because client acknowledgment is cumulative over the whole
/// session: acknowledging one handle destroys every handle delivered at or
/// before it, regardless of which consumer produced it. This is intentional
/// session-level (not per-consumer) semantics.
///
/// Every operation that mutates persistent state brackets the mutation in
/// the session's unit of work and applies the in-memory change only after
/// the commit succeeds, so memory and storage cannot drift apart.
pub struct PendingAckCache {
    ack_mode: AckMode,
    unacked: VecDeque<Arc<dyn MessageHandle>>,
    uow: Arc<dyn UnitOfWork>,
}

impl PendingAckCache {
    pub fn new(ack_mode: AckMode, uow: Arc<dyn UnitOfWork>) -> Self {
        Self {
            ack_mode,
            unacked: VecDeque::new(),
            uow,
        }
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    /// Marks the handle delivered, persists the flag and appends it to the
    /// delivery-order sequence.
    ///
    /// The delivered flag is committed before the network hand-off happens:
    /// a crash after the commit but before the hand-off reads as "delivered,
    /// no ack" and causes redelivery, never loss.
    pub async fn pre_send(&mut self, handle: Arc<dyn MessageHandle>) -> Result<()> {
        self.begin().await?;
        if let Err(e) = handle.set_delivered(true).await {
            self.rollback_quietly().await;
            return Err(SessionDispatchError::Persistence(e.to_string()));
        }
        self.commit().await?;
        self.unacked.push_back(handle);
        Ok(())
    }

    /// Completes a successful hand-off.
    ///
    /// Under Auto and DupsOk no explicit client acknowledgment will come, so
    /// the handle is destroyed right away. Under ClientAck and Transacted
    /// the handle stays outstanding until acknowledge/commit.
    pub async fn post_send(&mut self, consumer_id: u64, message_id: &MessageId) -> Result<()> {
        if !self.ack_mode.is_auto_acknowledge() {
            return Ok(());
        }
        let Some(position) = self.position_of(consumer_id, message_id) else {
            return Ok(());
        };
        self.begin().await?;
        if let Err(e) = self.unacked[position].destroy().await {
            self.rollback_quietly().await;
            return Err(SessionDispatchError::Persistence(e.to_string()));
        }
        self.commit().await?;
        let _ = self.unacked.remove(position);
        counter!(SESSION_ACKS_TOTAL.name).increment(1);
        Ok(())
    }

    /// Cumulative acknowledgment: destroys every handle delivered at or
    /// before the matched one, in delivery order, across all consumers of
    /// the session.
    ///
    /// An ack for an unknown or already-acknowledged message is a no-op; a
    /// duplicate ack can legally arrive from the client.
    pub async fn acknowledge(&mut self, consumer_id: u64, message_id: &MessageId) -> Result<()> {
        let Some(position) = self.position_of(consumer_id, message_id) else {
            trace!(
                "Stray acknowledgment for consumer {} message {}",
                consumer_id,
                message_id
            );
            return Ok(());
        };
        self.destroy_prefix(position + 1).await
    }

    /// Destroys every outstanding handle, front to back. Used by commit.
    pub async fn acknowledge_all(&mut self) -> Result<()> {
        let outstanding = self.unacked.len();
        self.destroy_prefix(outstanding).await
    }

    /// Empties the sequence and releases (not destroys) every handle, so the
    /// store re-offers the messages with the redelivered flag set. Used by
    /// recover, rollback and close.
    ///
    /// The snapshot happens first; each release then runs as its own store
    /// operation, because the enclosing unit of work was already rolled back
    /// by the caller. A failing release does not stop the remaining ones.
    pub async fn clear(&mut self) -> Result<()> {
        let drained: Vec<Arc<dyn MessageHandle>> = self.unacked.drain(..).collect();
        let released = drained.len();
        let mut first_error = None;
        for handle in drained {
            if let Err(e) = handle.release().await {
                warn!(
                    "Failed to release handle for consumer {} message {}: {}",
                    handle.consumer_id(),
                    handle.message_id(),
                    e
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if released > 0 {
            counter!(SESSION_REDELIVERIES_TOTAL.name).increment(released as u64);
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(SessionDispatchError::Persistence(e.to_string())),
        }
    }

    /// Compensating path for a failed hand-off: removes the handle from the
    /// sequence and releases it in a follow-up unit of work, so the message
    /// stays available for redelivery.
    pub(crate) async fn release_undelivered(
        &mut self,
        consumer_id: u64,
        message_id: &MessageId,
    ) -> Result<()> {
        let Some(position) = self.position_of(consumer_id, message_id) else {
            return Ok(());
        };
        let handle = self.unacked[position].clone();
        self.begin().await?;
        if let Err(e) = handle.release().await {
            self.rollback_quietly().await;
            return Err(SessionDispatchError::Persistence(e.to_string()));
        }
        self.commit().await?;
        let _ = self.unacked.remove(position);
        counter!(SESSION_REDELIVERIES_TOTAL.name).increment(1);
        Ok(())
    }

    async fn destroy_prefix(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.begin().await?;
        for handle in self.unacked.iter().take(count) {
            if let Err(e) = handle.destroy().await {
                self.rollback_quietly().await;
                return Err(SessionDispatchError::Persistence(e.to_string()));
            }
        }
        self.commit().await?;
        let _ = self.unacked.drain(..count);
        counter!(SESSION_ACKS_TOTAL.name).increment(count as u64);
        Ok(())
    }

    fn position_of(&self, consumer_id: u64, message_id: &MessageId) -> Option<usize> {
        self.unacked
            .iter()
            .position(|h| h.consumer_id() == consumer_id && h.message_id() == *message_id)
    }

    async fn begin(&self) -> Result<()> {
        self.uow
            .begin()
            .await
            .map_err(|e| SessionDispatchError::Persistence(e.to_string()))
    }

    async fn commit(&self) -> Result<()> {
        if let Err(e) = self.uow.commit().await {
            self.rollback_quietly().await;
            return Err(SessionDispatchError::Persistence(e.to_string()));
        }
        Ok(())
    }

    async fn rollback_quietly(&self) {
        if let Err(e) = self.uow.rollback().await {
            warn!("Unit of work rollback failed: {}", e);
        }
    }
}

#[cfg(test)]
#[path = "pending_ack_test.rs"]
mod pending_ack_test;
