use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::{ConnectionError, SubscriptionError};

/// Subscription name used when the host does not pick one. Existing
/// deployments already hold a durable cursor under this name.
pub const DEFAULT_SUBSCRIPTION_NAME: &str = "n8n-pulsar";

/// Operation timeout applied when the host does not configure one.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

/// Everything needed to open a broker connection.
///
/// Immutable once built; `new` rejects an empty service URL and a zero
/// operation timeout.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    service_url: String,
    auth_token: String,
    operation_timeout_secs: u64,
}

impl ConnectionParameters {
    pub fn new(
        service_url: impl Into<String>,
        auth_token: impl Into<String>,
        operation_timeout_secs: u64,
    ) -> Result<Self, ConnectionError> {
        let service_url = service_url.into().trim().to_string();
        if service_url.is_empty() {
            return Err(ConnectionError::EmptyServiceUrl);
        }
        if operation_timeout_secs == 0 {
            return Err(ConnectionError::InvalidOperationTimeout);
        }
        Ok(Self {
            service_url,
            auth_token: auth_token.into(),
            operation_timeout_secs,
        })
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

// Keeps the token out of logs.
impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("service_url", &self.service_url)
            .field("auth_token", &"<redacted>")
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .finish()
    }
}

/// Dispatch policy of a subscription among its consumers.
///
/// Deserializes through [`FromStr`], so configuration accepts the same
/// spellings as the CLI (`KeyShared`, `Key_Shared`, `key-shared`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum SubscriptionType {
    Exclusive,
    #[default]
    Shared,
    Failover,
    KeyShared,
}

impl SubscriptionType {
    /// Name of the type as the Pulsar WebSocket API expects it.
    pub fn as_pulsar_str(&self) -> &'static str {
        match self {
            SubscriptionType::Exclusive => "Exclusive",
            SubscriptionType::Shared => "Shared",
            SubscriptionType::Failover => "Failover",
            SubscriptionType::KeyShared => "Key_Shared",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_pulsar_str())
    }
}

impl FromStr for SubscriptionType {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-'))
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "exclusive" => Ok(SubscriptionType::Exclusive),
            "shared" => Ok(SubscriptionType::Shared),
            "failover" => Ok(SubscriptionType::Failover),
            "keyshared" => Ok(SubscriptionType::KeyShared),
            _ => Err(SubscriptionError::UnknownSubscriptionType(s.to_string())),
        }
    }
}

impl TryFrom<String> for SubscriptionType {
    type Error = SubscriptionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which topic to consume and under which subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionParameters {
    topic: String,
    subscription_name: String,
    subscription_type: SubscriptionType,
}

impl SubscriptionParameters {
    pub fn new(
        topic: impl Into<String>,
        subscription_name: impl Into<String>,
        subscription_type: SubscriptionType,
    ) -> Result<Self, SubscriptionError> {
        let topic = topic.into().trim().to_string();
        if topic.is_empty() {
            return Err(SubscriptionError::EmptyTopic);
        }
        let subscription_name = subscription_name.into().trim().to_string();
        if subscription_name.is_empty() {
            return Err(SubscriptionError::EmptySubscriptionName);
        }
        Ok(Self {
            topic,
            subscription_name,
            subscription_type,
        })
    }

    /// Shared subscription under [`DEFAULT_SUBSCRIPTION_NAME`], so several
    /// trigger instances can split one topic.
    pub fn for_topic(topic: impl Into<String>) -> Result<Self, SubscriptionError> {
        Self::new(topic, DEFAULT_SUBSCRIPTION_NAME, SubscriptionType::Shared)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.subscription_type
    }
}
