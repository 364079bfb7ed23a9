//! The consume / emit / acknowledge loop.
//!
//! One iteration: check the token, wait for a message (raced against the
//! token), emit it as a one-element batch, acknowledge it if the emit
//! succeeded. An emit that has started always runs to its acknowledge
//! before the token is looked at again, so a message is never emitted
//! without an acknowledge attempt and never acknowledged without a
//! successful emit.
//!
//! The loop ends on cancellation or on a fatal receive error; either way it
//! closes the consumer and then the connection exactly once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::state::{LoopControl, LoopState};
use crate::broker::{Connection, Consumer, Message};
use crate::emitter::{Emitter, OutputRecord};
use crate::utils::error::ReceiveError;

/// Tuning knobs of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    /// Upper bound of a single `receive`; `None` waits until a message or
    /// cancellation arrives.
    pub receive_timeout: Option<Duration>,
    /// Pause after a transient receive error.
    pub retry_backoff: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            receive_timeout: None,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    Fatal(ReceiveError),
}

/// The broker handles a loop owns. Nothing else holds them.
pub struct BrokerResources {
    pub topic: String,
    pub connection: Box<dyn Connection>,
    pub consumer: Box<dyn Consumer>,
}

impl BrokerResources {
    /// Close the consumer, then the connection. Errors are logged only.
    pub async fn close(mut self) {
        if let Err(err) = self.consumer.close().await {
            warn!(topic = %self.topic, error = %err, "failed to close consumer");
        }
        close_connection(self.connection.as_mut()).await;
    }
}

/// Best-effort close used during teardown and for half-built startups.
pub async fn close_connection(connection: &mut dyn Connection) {
    if let Err(err) = connection.close().await {
        warn!(error = %err, "failed to close broker connection");
    }
}

pub struct ConsumeLoop {
    resources: BrokerResources,
    emitter: Arc<dyn Emitter>,
    control: LoopControl,
    options: LoopOptions,
}

impl ConsumeLoop {
    pub fn new(
        resources: BrokerResources,
        emitter: Arc<dyn Emitter>,
        control: LoopControl,
        options: LoopOptions,
    ) -> Self {
        Self {
            resources,
            emitter,
            control,
            options,
        }
    }

    pub async fn run(mut self) -> LoopExit {
        let token = self.control.token().clone();
        self.control.set_state(LoopState::Running);
        info!(topic = %self.resources.topic, "consume loop running");

        let exit = loop {
            if token.is_cancelled() {
                break LoopExit::Cancelled;
            }

            let received = tokio::select! {
                biased;
                _ = token.cancelled() => break LoopExit::Cancelled,
                received = next_message(
                    self.resources.consumer.as_mut(),
                    self.options.receive_timeout,
                ) => received,
            };

            match received {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => continue,
                Err(err) if err.is_fatal() => {
                    error!(topic = %self.resources.topic, error = %err, "receive failed, stopping");
                    break LoopExit::Fatal(err);
                }
                Err(err) => {
                    self.control.stats().record_receive_error();
                    warn!(topic = %self.resources.topic, error = %err, "receive failed, retrying");
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break LoopExit::Cancelled,
                        _ = tokio::time::sleep(self.options.retry_backoff) => {}
                    }
                }
            }
        };

        self.control.set_state(LoopState::Draining);
        let topic = self.resources.topic.clone();
        self.resources.close().await;
        self.control.set_state(LoopState::Stopped);
        info!(%topic, exit = ?exit, "consume loop stopped");
        exit
    }

    async fn dispatch(&mut self, message: Message) {
        let stats = self.control.stats();
        stats.record_received();

        let record = OutputRecord::from_payload(&message.payload);
        if let Err(err) = self.emitter.emit(vec![record]).await {
            stats.record_emit_failure();
            warn!(
                message_id = %message.id,
                error = %err,
                "emit failed, message left for redelivery"
            );
            return;
        }
        stats.record_emitted();

        match self.resources.consumer.acknowledge(&message.id).await {
            Ok(()) => {
                stats.record_acknowledged();
                debug!(message_id = %message.id, "message acknowledged");
            }
            Err(err) => {
                stats.record_ack_failure();
                warn!(message_id = %message.id, error = %err, "acknowledge failed");
            }
        }
    }
}

/// `Ok(None)` when the receive timeout elapsed without a message.
async fn next_message(
    consumer: &mut dyn Consumer,
    receive_timeout: Option<Duration>,
) -> Result<Option<Message>, ReceiveError> {
    match receive_timeout {
        Some(limit) => match tokio::time::timeout(limit, consumer.receive()).await {
            Ok(received) => received.map(Some),
            Err(_) => Ok(None),
        },
        None => consumer.receive().await.map(Some),
    }
}
