use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::message::{Message, MessageId};
use crate::wait::WaitCondition;

/// One delivery attempt of one message to one consumer.
///
/// Handles are owned by the destination's message store; the session only
/// borrows them. A handle ends up either destroyed (permanently consumed) or
/// released (returned to the store for redelivery) -- every code path that
/// obtains one is responsible for driving it to one of those two states.
#[async_trait]
pub trait MessageHandle: Send + Sync {
    fn consumer_id(&self) -> u64;

    fn message_id(&self) -> MessageId;

    async fn is_delivered(&self) -> bool;

    /// Flips the delivered flag and persists it within the enclosing unit of
    /// work.
    async fn set_delivered(&self, delivered: bool) -> Result<()>;

    /// Resolves the underlying message payload.
    async fn message(&self) -> Result<Message>;

    /// Returns the message to the store undelivered; the store re-offers it
    /// with the redelivered flag set.
    async fn release(&self) -> Result<()>;

    /// Permanently removes this delivery and its message from the store.
    async fn destroy(&self) -> Result<()>;
}

/// The session-side view of one registered consumer.
///
/// Selector evaluation and destination routing live behind this trait; the
/// endpoint already knows how to produce the next eligible message for
/// itself.
#[async_trait]
pub trait ConsumerEndpoint: Send + Sync {
    fn id(&self) -> u64;

    /// Number of messages currently eligible for this consumer.
    async fn message_count(&self) -> usize;

    async fn is_asynchronous(&self) -> bool;

    async fn set_asynchronous(&self, enabled: bool);

    /// Queue browsers peek without consuming; everything else receives.
    fn is_browser(&self) -> bool;

    async fn is_waiting_for_message(&self) -> bool;

    /// Registers (or clears) the wait condition of a blocked synchronous
    /// receive so a later notification can satisfy an equivalent wait.
    async fn set_waiting_for_message(&self, condition: Option<WaitCondition>);

    /// Installs the channel on which this endpoint reports "message
    /// available" events, tagged with its consumer id.
    async fn set_availability_notifier(&self, notifier: Option<mpsc::UnboundedSender<u64>>);

    /// Blocking receive: returns once a message is available or `cancel` is
    /// satisfied, whichever happens first.
    async fn receive(&self, cancel: WaitCondition) -> Result<Option<Arc<dyn MessageHandle>>>;

    /// Positional peek used by queue browsers. Never consumes the message or
    /// marks it delivered.
    async fn browse_next(&self, cursor: usize) -> Result<Option<Message>>;
}

/// The remote client side of a session.
#[async_trait]
pub trait SessionListener: Send + Sync {
    /// Pushes a message to the remote client; returns whether it was
    /// accepted.
    async fn on_message(&self, message: Message) -> Result<bool>;

    /// Notifies a synchronously waiting client that a message can now be
    /// received. The blocked receive call performs the consumption itself.
    async fn on_message_available(&self) -> Result<()>;
}

/// The immediate-visibility publish path, used for sends outside any
/// transaction branch.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: Message) -> Result<()>;
}
