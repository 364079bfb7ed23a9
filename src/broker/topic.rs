//! Topic bookkeeping for the in-memory broker.
//!
//! A `Topic` holds one `SubscriptionQueue` per subscription name. Every
//! published message is copied into each queue; consumers attached to the
//! same subscription then compete for that queue according to its
//! `SubscriptionType`.
//!
//! Callers must synchronize access (the broker keeps everything behind one
//! lock).

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::broker::message::{Message, MessageId};
use crate::broker::params::SubscriptionType;
use crate::utils::error::{AckError, SubscriptionError};

pub type ConsumerId = u64;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
    pub redelivery_count: u32,
    sequence: u64,
}

impl StoredMessage {
    pub fn new(id: MessageId, payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            id,
            payload,
            published_at: Utc::now(),
            redelivery_count: 0,
            sequence,
        }
    }

    fn to_message(&self) -> Message {
        Message {
            id: self.id.clone(),
            payload: self.payload.clone(),
            publish_time: Some(self.published_at),
            redelivery_count: self.redelivery_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: StoredMessage,
    pub consumer: ConsumerId,
    pub delivered_at: Instant,
}

#[derive(Debug)]
pub struct SubscriptionQueue {
    pub kind: SubscriptionType,
    pub backlog: VecDeque<StoredMessage>,
    pub pending: HashMap<MessageId, PendingMessage>,
    pub consumers: BTreeSet<ConsumerId>,
    pub acknowledged: Vec<MessageId>,
}

impl SubscriptionQueue {
    pub fn new(kind: SubscriptionType) -> Self {
        Self {
            kind,
            backlog: VecDeque::new(),
            pending: HashMap::new(),
            consumers: BTreeSet::new(),
            acknowledged: Vec::new(),
        }
    }

    /// Attach a consumer. An exclusive subscription accepts only one.
    pub fn attach(&mut self, name: &str, consumer: ConsumerId) -> Result<(), SubscriptionError> {
        if self.kind == SubscriptionType::Exclusive && !self.consumers.is_empty() {
            return Err(SubscriptionError::ConsumerBusy(name.to_string()));
        }
        self.consumers.insert(consumer);
        Ok(())
    }

    /// Detach a consumer and put its unacknowledged messages back at the
    /// head of the backlog, oldest first.
    pub fn detach(&mut self, consumer: ConsumerId) {
        self.consumers.remove(&consumer);
        let ids: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .map(|(id, _)| id.clone())
            .collect();
        self.requeue(ids);
    }

    /// Failover subscriptions only feed the earliest attached consumer.
    pub fn can_deliver_to(&self, consumer: ConsumerId) -> bool {
        match self.kind {
            SubscriptionType::Failover => self.consumers.first() == Some(&consumer),
            _ => self.consumers.contains(&consumer),
        }
    }

    pub fn next_for(&mut self, consumer: ConsumerId, now: Instant) -> Option<Message> {
        if !self.can_deliver_to(consumer) {
            return None;
        }
        let stored = self.backlog.pop_front()?;
        let message = stored.to_message();
        self.pending.insert(
            stored.id.clone(),
            PendingMessage {
                message: stored,
                consumer,
                delivered_at: now,
            },
        );
        Some(message)
    }

    pub fn acknowledge(&mut self, id: &MessageId) -> Result<(), AckError> {
        match self.pending.remove(id) {
            Some(_) => {
                self.acknowledged.push(id.clone());
                Ok(())
            }
            None => Err(AckError::UnknownMessage(id.to_string())),
        }
    }

    /// Requeue messages delivered longer than `ack_timeout` ago. Returns
    /// whether anything moved.
    pub fn requeue_expired(&mut self, now: Instant, ack_timeout: Duration) -> bool {
        let expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= ack_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let moved = !expired.is_empty();
        self.requeue(expired);
        moved
    }

    pub fn next_expiry(&self, ack_timeout: Duration) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.delivered_at + ack_timeout)
            .min()
    }

    fn requeue(&mut self, ids: Vec<MessageId>) {
        let mut messages: Vec<StoredMessage> = ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .map(|p| p.message)
            .collect();
        messages.sort_by_key(|m| std::cmp::Reverse(m.sequence));
        for mut message in messages {
            message.redelivery_count += 1;
            self.backlog.push_front(message);
        }
    }
}

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscriptions: HashMap<String, SubscriptionQueue>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: HashMap::new(),
        }
    }

    /// Subscription queue by name, created with `kind` on first use.
    pub fn subscription_mut(&mut self, name: &str, kind: SubscriptionType) -> &mut SubscriptionQueue {
        self.subscriptions
            .entry(name.to_string())
            .or_insert_with(|| SubscriptionQueue::new(kind))
    }

    /// Copy a message into every subscription. Returns how many received it.
    pub fn fan_out(&mut self, message: StoredMessage) -> usize {
        for queue in self.subscriptions.values_mut() {
            queue.backlog.push_back(message.clone());
        }
        self.subscriptions.len()
    }
}
