//! In-process broker
//!
//! `MemoryBroker` implements [`BrokerClient`] without any network: topics and
//! subscriptions live in a map behind one lock, and consumers block on a
//! shared `Notify` until something changes. It follows broker semantics
//! closely enough to exercise the consume loop:
//!
//! - every subscription of a topic gets its own copy of each message
//! - shared (and key-shared) subscriptions spread messages over consumers,
//!   exclusive subscriptions refuse a second consumer, failover
//!   subscriptions feed only the earliest attached consumer
//! - unacknowledged messages are redelivered when their consumer goes away,
//!   or after the optional ack timeout
//!
//! Tests can also require an auth token, mark topics unavailable, reject
//! acknowledgements, inject receive errors and drop every connection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::topic::{ConsumerId, StoredMessage, SubscriptionQueue, Topic};
use super::{
    BrokerClient, Connection, ConnectionParameters, Consumer, Message, MessageId,
    SubscriptionParameters,
};
use crate::utils::error::{AckError, CloseError, ConnectionError, ReceiveError, SubscriptionError};

/// Connection and consumer counters, used to check that nothing leaks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBrokerStats {
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub consumers_opened: usize,
    pub consumers_closed: usize,
}

impl MemoryBrokerStats {
    pub fn open_connections(&self) -> usize {
        self.connections_opened - self.connections_closed
    }

    pub fn open_consumers(&self) -> usize {
        self.consumers_opened - self.consumers_closed
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: std::collections::HashMap<String, Topic>,
    required_token: Option<String>,
    unavailable_topics: HashSet<String>,
    ack_timeout: Option<Duration>,
    reject_acks: bool,
    injected_receive_error: Option<ReceiveError>,
    generation: u64,
    next_consumer_id: ConsumerId,
    next_sequence: u64,
    stats: MemoryBrokerStats,
}

impl BrokerState {
    fn queue_mut(&mut self, topic: &str, subscription: &str) -> Option<&mut SubscriptionQueue> {
        self.topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject subscriptions whose connection token differs from `token`.
    pub fn with_required_token(self, token: impl Into<String>) -> Self {
        self.lock().required_token = Some(token.into());
        self
    }

    /// Redeliver messages that stay unacknowledged longer than `timeout`.
    pub fn with_ack_timeout(self, timeout: Duration) -> Self {
        self.lock().ack_timeout = Some(timeout);
        self
    }

    pub fn set_topic_unavailable(&self, topic: &str, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable_topics.insert(topic.to_string());
        } else {
            state.unavailable_topics.remove(topic);
        }
    }

    pub fn set_reject_acks(&self, reject: bool) {
        self.lock().reject_acks = reject;
    }

    /// The next `receive` on any consumer fails with `error`.
    pub fn inject_receive_error(&self, error: ReceiveError) {
        self.lock().injected_receive_error = Some(error);
        self.shared.notify.notify_waiters();
    }

    /// Simulates the cluster going away: every consumer opened so far fails
    /// its next `receive` with a fatal error.
    pub fn drop_connections(&self) {
        self.lock().generation += 1;
        warn!("memory broker dropped all connections");
        self.shared.notify.notify_waiters();
    }

    /// Publish to every subscription of `topic`. Messages published to a
    /// topic without subscriptions are discarded.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> MessageId {
        let id = MessageId::new(Uuid::new_v4().to_string());
        let mut state = self.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let delivered = match state.topics.get_mut(topic) {
            Some(t) => t.fan_out(StoredMessage::new(id.clone(), payload.into(), sequence)),
            None => 0,
        };
        drop(state);

        if delivered == 0 {
            debug!(topic, message_id = %id, "no subscriptions, message discarded");
        } else {
            self.shared.notify.notify_waiters();
        }
        id
    }

    pub fn acknowledged(&self, topic: &str, subscription: &str) -> Vec<MessageId> {
        self.lock()
            .queue_mut(topic, subscription)
            .map(|q| q.acknowledged.clone())
            .unwrap_or_default()
    }

    pub fn backlog_len(&self, topic: &str, subscription: &str) -> usize {
        self.lock()
            .queue_mut(topic, subscription)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    pub fn pending_len(&self, topic: &str, subscription: &str) -> usize {
        self.lock()
            .queue_mut(topic, subscription)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let mut state = self.lock();
        state.stats.connections_opened += 1;
        let generation = state.generation;
        drop(state);

        debug!(service_url = params.service_url(), "memory connection opened");
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            token: params.auth_token().to_string(),
            generation,
            closed: false,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    token: String,
    generation: u64,
    closed: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(
        &mut self,
        params: &SubscriptionParameters,
    ) -> Result<Box<dyn Consumer>, SubscriptionError> {
        if self.closed {
            return Err(ConnectionError::Closed.into());
        }

        let mut state = self.broker.lock();
        if state.generation != self.generation {
            return Err(ConnectionError::Transport("connection dropped".into()).into());
        }
        if let Some(required) = &state.required_token {
            if *required != self.token {
                return Err(SubscriptionError::Unauthorized("invalid token".into()));
            }
        }
        if state.unavailable_topics.contains(params.topic()) {
            return Err(SubscriptionError::TopicUnavailable(params.topic().to_string()));
        }

        let id = state.next_consumer_id;
        state.next_consumer_id += 1;
        state
            .topics
            .entry(params.topic().to_string())
            .or_insert_with(|| Topic::new(params.topic()))
            .subscription_mut(params.subscription_name(), params.subscription_type())
            .attach(params.subscription_name(), id)?;
        state.stats.consumers_opened += 1;
        drop(state);

        info!(
            topic = params.topic(),
            subscription = params.subscription_name(),
            consumer = id,
            "memory consumer attached"
        );
        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            id,
            topic: params.topic().to_string(),
            subscription: params.subscription_name().to_string(),
            generation: self.generation,
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        if !self.closed {
            self.closed = true;
            self.broker.lock().stats.connections_closed += 1;
        }
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    id: ConsumerId,
    topic: String,
    subscription: String,
    generation: u64,
    closed: bool,
}

impl MemoryConsumer {
    fn detach(&mut self) {
        if let Some(queue) = self.broker.lock().queue_mut(&self.topic, &self.subscription) {
            queue.detach(self.id);
        }
        self.broker.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&mut self) -> Result<Message, ReceiveError> {
        loop {
            let notified = self.broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.broker.lock();
                if self.closed {
                    return Err(ReceiveError::Closed);
                }
                if state.generation != self.generation {
                    return Err(ReceiveError::Fatal("connection dropped by broker".into()));
                }
                if let Some(err) = state.injected_receive_error.take() {
                    return Err(err);
                }

                let ack_timeout = state.ack_timeout;
                let now = Instant::now();
                let Some(queue) = state.queue_mut(&self.topic, &self.subscription) else {
                    return Err(ReceiveError::Fatal("subscription no longer exists".into()));
                };
                if let Some(timeout) = ack_timeout {
                    queue.requeue_expired(now, timeout);
                }
                if let Some(message) = queue.next_for(self.id, now) {
                    return Ok(message);
                }
                ack_timeout.and_then(|t| queue.next_expiry(t))
            };

            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn acknowledge(&mut self, id: &MessageId) -> Result<(), AckError> {
        if self.closed {
            return Err(AckError::Closed);
        }
        let mut state = self.broker.lock();
        if state.generation != self.generation {
            return Err(AckError::Transport("connection dropped by broker".into()));
        }
        if state.reject_acks {
            return Err(AckError::Transport("acknowledgement rejected".into()));
        }
        match state.queue_mut(&self.topic, &self.subscription) {
            Some(queue) => queue.acknowledge(id),
            None => Err(AckError::UnknownMessage(id.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.detach();
        self.broker.lock().stats.consumers_closed += 1;
        debug!(topic = %self.topic, consumer = self.id, "memory consumer closed");
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            self.detach();
        }
    }
}
