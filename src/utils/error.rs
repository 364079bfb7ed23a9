//! The `error` module defines the error types used across `pulsar-trigger`.
//!
//! Each stage of the consume loop has its own error type so the loop can
//! decide what is fatal (startup, unrecoverable receive) and what is only
//! logged (acknowledge, emit, teardown).

use std::time::Duration;

use thiserror::Error;

/// Failure to open or use a broker connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("service url must not be empty")]
    EmptyServiceUrl,

    #[error("unsupported service url `{0}`")]
    InvalidServiceUrl(String),

    #[error("operation timeout must be greater than zero")]
    InvalidOperationTimeout,

    #[error("connection is closed")]
    Closed,

    #[error("broker connection failed: {0}")]
    Transport(String),
}

/// Failure to create a consumer on a topic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("subscription name must not be empty")]
    EmptySubscriptionName,

    #[error("invalid topic name `{0}`")]
    InvalidTopic(String),

    #[error("unknown subscription type `{0}`")]
    UnknownSubscriptionType(String),

    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    #[error("topic `{0}` is unavailable")]
    TopicUnavailable(String),

    #[error("subscription `{0}` already has an exclusive consumer")]
    ConsumerBusy(String),

    #[error("subscribe timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("subscribe failed: {0}")]
    Transport(String),
}

/// Failure while waiting for the next message.
///
/// `Transient` errors are retried by the consume loop; everything else ends it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("transient receive failure: {0}")]
    Transient(String),

    #[error("unrecoverable receive failure: {0}")]
    Fatal(String),

    #[error("consumer is closed")]
    Closed,
}

impl ReceiveError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReceiveError::Transient(_))
    }
}

/// Failure to acknowledge a message. Never fatal; the broker redelivers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("unknown message id `{0}`")]
    UnknownMessage(String),

    #[error("consumer is closed")]
    Closed,

    #[error("acknowledge timed out after {0:?}")]
    TimedOut(Duration),

    #[error("acknowledge failed: {0}")]
    Transport(String),
}

/// Failure reported by an [`Emitter`](crate::emitter::Emitter).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("emitter rejected batch: {0}")]
    Rejected(String),

    #[error("emitter is closed")]
    Closed,

    #[error("failed to write records: {0}")]
    Write(String),
}

/// Failure while releasing a consumer or connection. Logged only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloseError {
    #[error("close timed out after {0:?}")]
    TimedOut(Duration),

    #[error("close failed: {0}")]
    Transport(String),
}

/// Failure surfaced synchronously by `LifecycleController::start`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("could not connect to broker: {0}")]
    Connect(#[from] ConnectionError),

    #[error("could not subscribe: {0}")]
    Subscribe(#[from] SubscriptionError),

    #[error("shutdown requested before the consumer started")]
    Cancelled,
}
