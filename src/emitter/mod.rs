//! The `emitter` module is the host side of the trigger.
//!
//! The consume loop turns each received message into one [`OutputRecord`]
//! and hands it to an [`Emitter`] as a one-element batch. The emitter's
//! result decides whether the message gets acknowledged.

pub mod channel;
pub mod json_lines;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::error::EmitError;

pub use channel::ChannelEmitter;
pub use json_lines::JsonLinesEmitter;

/// One decoded message as delivered to the host.
///
/// Serializes as `{"message": "<payload>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub message: String,
}

impl OutputRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Decode a raw payload as UTF-8, replacing invalid sequences.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            message: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// The host's ingestion point.
///
/// `emit` may suspend (for back-pressure); the loop waits for it before
/// receiving the next message. An `Err` leaves the message unacknowledged
/// and the loop moves on; there is no local retry.
///
/// When the rejected message comes back depends on the broker. Pulsar
/// without an ack timeout on the subscription redelivers it only once this
/// consumer disconnects (on `stop` or a fatal error); with an ack timeout it
/// comes back after that timeout.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(&self, batch: Vec<OutputRecord>) -> Result<(), EmitError>;
}
