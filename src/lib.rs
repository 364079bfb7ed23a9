//! # pulsar-trigger
//!
//! `pulsar-trigger` is a long-running subscriber: it attaches to one topic of
//! a message broker, hands every message to a host-supplied emitter and
//! acknowledges it once the emitter accepted it. The host gets a shutdown
//! handle back and can stop the subscriber at any time, even while it is
//! waiting for a message.
//!
//! ## Core Modules
//!
//! - `broker`: the connection/consumer traits plus two implementations, an
//!   in-memory broker and a Pulsar WebSocket API client.
//! - `consumer`: the consume / emit / acknowledge loop and its shared state.
//! - `emitter`: the host-facing `Emitter` trait and ready-made emitters.
//! - `lifecycle`: starts the loop and exposes the idempotent `stop`.
//! - `config`: loading settings from files and environment variables.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod emitter;
pub mod lifecycle;
pub mod utils;

pub use broker::{
    BrokerClient, ConnectionParameters, Message, MessageId, SubscriptionParameters,
    SubscriptionType,
};
pub use emitter::{Emitter, OutputRecord};
pub use lifecycle::{LifecycleController, LifecycleOptions, ShutdownHandle, StopOutcome};
pub use utils::error::StartupError;

#[cfg(test)]
mod tests;
