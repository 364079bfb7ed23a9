//! The `broker` module is the seam between the trigger and the messaging
//! cluster.
//!
//! The consume loop only ever sees three traits:
//!
//! - [`BrokerClient`]: opens a [`Connection`] from [`ConnectionParameters`].
//! - [`Connection`]: creates a [`Consumer`] bound to one topic and one
//!   subscription.
//! - [`Consumer`]: receives and acknowledges messages.
//!
//! Two implementations ship with the crate: [`memory::MemoryBroker`], an
//! in-process broker used by tests and demos, and
//! [`websocket::WebSocketClient`], which talks to Apache Pulsar through its
//! WebSocket consumer API.

pub mod memory;
pub mod message;
pub mod params;
pub mod topic;
pub mod websocket;

use async_trait::async_trait;

use crate::utils::error::{AckError, CloseError, ConnectionError, ReceiveError, SubscriptionError};

pub use message::{Message, MessageId};
pub use params::{
    ConnectionParameters, DEFAULT_SUBSCRIPTION_NAME, SubscriptionParameters, SubscriptionType,
};

/// Factory for broker connections.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// An open connection to the cluster.
#[async_trait]
pub trait Connection: Send {
    async fn subscribe(
        &mut self,
        params: &SubscriptionParameters,
    ) -> Result<Box<dyn Consumer>, SubscriptionError>;

    /// Releases the connection. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), CloseError>;
}

/// A consumer attached to one subscription.
///
/// `receive` must be cancel-safe: dropping the future before it resolves
/// must not lose a message.
#[async_trait]
pub trait Consumer: Send {
    async fn receive(&mut self) -> Result<Message, ReceiveError>;

    async fn acknowledge(&mut self, id: &MessageId) -> Result<(), AckError>;

    /// Detaches the consumer. Unacknowledged messages become eligible for
    /// redelivery. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), CloseError>;
}
