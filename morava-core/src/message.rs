use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

// The MessageId identifies a published message across the broker. The consumer
// sends it back in the ack mechanism so the session can find the matching
// outstanding delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    // Identifies the producer, unique per connection
    pub producer_id: u64,
    // Sequence number assigned by the producer, monotonic per producer
    pub sequence: u64,
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "producer:_{}_sequence:_{}", self.producer_id, self.sequence)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    // Identifies the message, associated with a unique producer
    pub msg_id: MessageId,
    // The actual payload of the message
    pub payload: Vec<u8>,
    // Timestamp for when the message was published
    pub publish_time: u64,
    // Identifies the producer's name
    pub producer_name: String,
    // Name of the destination (queue or topic) the message was published to
    pub destination_name: String,
    // Set when the message was delivered before but never acknowledged
    pub redelivered: bool,
    // User-defined properties/attributes
    pub attributes: HashMap<String, String>,
}

impl Message {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Acknowledgment policy of a session, fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// Delivery itself acknowledges the message.
    Auto,
    /// Like Auto, but duplicates after a failure are acceptable.
    DupsOk,
    /// The client acknowledges explicitly; acknowledgment is cumulative.
    ClientAck,
    /// Acknowledgment is deferred to the session transaction outcome.
    Transacted,
}

impl AckMode {
    /// True for the modes where a successful hand-off consumes the message
    /// without an explicit acknowledgment from the client.
    pub fn is_auto_acknowledge(&self) -> bool {
        matches!(self, AckMode::Auto | AckMode::DupsOk)
    }
}

impl Display for AckMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => write!(f, "Auto"),
            AckMode::DupsOk => write!(f, "DupsOk"),
            AckMode::ClientAck => write!(f, "ClientAck"),
            AckMode::Transacted => write!(f, "Transacted"),
        }
    }
}
