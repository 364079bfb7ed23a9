use std::time::Duration;

use serde::Deserialize;

use crate::broker::params::{DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_SUBSCRIPTION_NAME};
use crate::broker::{ConnectionParameters, SubscriptionParameters, SubscriptionType};
use crate::consumer::LoopOptions;
use crate::lifecycle::LifecycleOptions;
use crate::utils::error::{ConnectionError, SubscriptionError};

/// Top-level configuration of the trigger.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub subscription: SubscriptionSettings,
    pub consumer: ConsumerSettings,
    pub logging: LoggingSettings,
}

/// Where the cluster is and how to authenticate against it.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub service_url: String,
    pub auth_token: String,
    pub operation_timeout_secs: u64,
}

/// Which topic to consume and under which subscription.
#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionSettings {
    pub topic: String,
    pub name: String,
    pub subscription_type: SubscriptionType,
}

/// Consume loop tuning.
///
/// A `receive_timeout_ms` of 0 means receive waits indefinitely.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub receive_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration loaded from files or environment. Missing values
/// are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub subscription: Option<PartialSubscriptionSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub service_url: Option<String>,
    pub auth_token: Option<String>,
    pub operation_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSubscriptionSettings {
    pub topic: Option<String>,
    pub name: Option<String>,
    pub subscription_type: Option<SubscriptionType>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub receive_timeout_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                service_url: "ws://127.0.0.1:8080".to_string(),
                auth_token: String::new(),
                operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            },
            subscription: SubscriptionSettings {
                topic: String::new(),
                name: DEFAULT_SUBSCRIPTION_NAME.to_string(),
                subscription_type: SubscriptionType::Shared,
            },
            consumer: ConsumerSettings {
                receive_timeout_ms: 0,
                retry_backoff_ms: 500,
                shutdown_grace_secs: 10,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fill every field missing from `partial` with the default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let broker = partial.broker.unwrap_or_default();
        let subscription = partial.subscription.unwrap_or_default();
        let consumer = partial.consumer.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                service_url: broker.service_url.unwrap_or(default.broker.service_url),
                auth_token: broker.auth_token.unwrap_or(default.broker.auth_token),
                operation_timeout_secs: broker
                    .operation_timeout_secs
                    .unwrap_or(default.broker.operation_timeout_secs),
            },
            subscription: SubscriptionSettings {
                topic: subscription.topic.unwrap_or(default.subscription.topic),
                name: subscription.name.unwrap_or(default.subscription.name),
                subscription_type: subscription
                    .subscription_type
                    .unwrap_or(default.subscription.subscription_type),
            },
            consumer: ConsumerSettings {
                receive_timeout_ms: consumer
                    .receive_timeout_ms
                    .unwrap_or(default.consumer.receive_timeout_ms),
                retry_backoff_ms: consumer
                    .retry_backoff_ms
                    .unwrap_or(default.consumer.retry_backoff_ms),
                shutdown_grace_secs: consumer
                    .shutdown_grace_secs
                    .unwrap_or(default.consumer.shutdown_grace_secs),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }

    pub fn connection_parameters(&self) -> Result<ConnectionParameters, ConnectionError> {
        ConnectionParameters::new(
            self.broker.service_url.clone(),
            self.broker.auth_token.clone(),
            self.broker.operation_timeout_secs,
        )
    }

    pub fn subscription_parameters(&self) -> Result<SubscriptionParameters, SubscriptionError> {
        SubscriptionParameters::new(
            self.subscription.topic.clone(),
            self.subscription.name.clone(),
            self.subscription.subscription_type,
        )
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        let receive_timeout = match self.consumer.receive_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        LifecycleOptions {
            shutdown_grace: Duration::from_secs(self.consumer.shutdown_grace_secs),
            loop_options: LoopOptions {
                receive_timeout,
                retry_backoff: Duration::from_millis(self.consumer.retry_backoff_ms),
            },
        }
    }
}
