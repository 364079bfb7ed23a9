//! Pulsar WebSocket consumer
//!
//! Talks to an Apache Pulsar cluster through its WebSocket API instead of the
//! binary protocol:
//!
//! - a consumer is one WebSocket on
//!   `/ws/v2/consumer/{domain}/{tenant}/{namespace}/{topic}/{subscription}`
//! - the broker pushes JSON frames `{"messageId", "payload" (base64), ...}`
//! - the client acknowledges with `{"messageId": "..."}` on the same socket
//!
//! The "connection" only validates the service URL and carries the token and
//! operation timeout; each subscribe opens its own socket. Handshake,
//! acknowledge and close are bounded by the operation timeout; receive is
//! not (it waits for the next message and relies on cancellation).
//!
//! A message that is never acknowledged (failed emit) stays with this
//! consumer. Pulsar redelivers it when the socket closes or, if the
//! subscription has an ack timeout, once that expires.
//!
//! `wss`/`https` URLs need a TLS-enabled `tokio-tungstenite` build.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::http::{HeaderValue, StatusCode};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use super::{
    BrokerClient, Connection, ConnectionParameters, Consumer, Message, MessageId,
    SubscriptionParameters,
};
use crate::utils::error::{AckError, CloseError, ConnectionError, ReceiveError, SubscriptionError};

const DEFAULT_TENANT: &str = "public";
const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    message_id: String,
    payload: String,
    #[serde(default)]
    publish_time: Option<String>,
    #[serde(default)]
    redelivery_count: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckFrame<'a> {
    message_id: &'a str,
}

/// Map a service URL onto the WebSocket base URL (`http` → `ws`,
/// `https` → `wss`), without a trailing slash.
pub fn websocket_base_url(service_url: &str) -> Result<String, ConnectionError> {
    let invalid = || ConnectionError::InvalidServiceUrl(service_url.to_string());
    let trimmed = service_url.trim().trim_end_matches('/');
    let (scheme, rest) = trimmed.split_once("://").ok_or_else(invalid)?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid()),
    };
    if rest.is_empty() {
        return Err(invalid());
    }
    Ok(format!("{scheme}://{rest}"))
}

/// Expand a topic name into `{domain}/{tenant}/{namespace}/{topic}`.
///
/// Accepts `persistent://t/ns/topic`, `non-persistent://t/ns/topic`,
/// `t/ns/topic` and a bare `topic` (placed in `public/default`).
pub fn topic_path(topic: &str) -> Result<String, SubscriptionError> {
    let invalid = || SubscriptionError::InvalidTopic(topic.to_string());
    let (domain, rest) = match topic.split_once("://") {
        Some((domain @ ("persistent" | "non-persistent"), rest)) => (domain, rest),
        Some(_) => return Err(invalid()),
        None => ("persistent", topic),
    };

    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(invalid());
    }
    let segments = match parts.as_slice() {
        [name] if !topic.contains("://") => vec![DEFAULT_TENANT, DEFAULT_NAMESPACE, *name],
        [tenant, namespace, name] => vec![*tenant, *namespace, *name],
        _ => return Err(invalid()),
    };

    let encoded: Vec<String> = segments.into_iter().map(encode_segment).collect();
    Ok(format!("{domain}/{}", encoded.join("/")))
}

pub fn consumer_url(
    base_url: &str,
    params: &SubscriptionParameters,
    consumer_name: &str,
) -> Result<String, SubscriptionError> {
    Ok(format!(
        "{base_url}/ws/v2/consumer/{}/{}?subscriptionType={}&consumerName={}",
        topic_path(params.topic())?,
        encode_segment(params.subscription_name()),
        params.subscription_type().as_pulsar_str(),
        encode_segment(consumer_name),
    ))
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Decode one broker frame into a [`Message`].
pub fn decode_frame(text: &str) -> Result<Message, ReceiveError> {
    let frame: InboundFrame = serde_json::from_str(text)
        .map_err(|e| ReceiveError::Transient(format!("malformed frame: {e}")))?;
    let payload = STANDARD.decode(frame.payload.as_bytes()).map_err(|e| {
        ReceiveError::Transient(format!(
            "message {} has an invalid payload encoding: {e}",
            frame.message_id
        ))
    })?;

    Ok(Message {
        id: MessageId::new(frame.message_id),
        payload,
        publish_time: frame.publish_time.as_deref().and_then(parse_publish_time),
        redelivery_count: frame.redelivery_count.unwrap_or(0),
    })
}

fn parse_publish_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

fn handshake_error(err: tungstenite::Error, topic: &str) -> SubscriptionError {
    match err {
        tungstenite::Error::Http(response) => match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SubscriptionError::Unauthorized(format!("broker answered {}", response.status()))
            }
            StatusCode::NOT_FOUND => SubscriptionError::TopicUnavailable(topic.to_string()),
            status => SubscriptionError::Transport(format!("handshake rejected with {status}")),
        },
        tungstenite::Error::Io(e) => ConnectionError::Transport(e.to_string()).into(),
        other => SubscriptionError::Transport(other.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebSocketClient {
    consumer_name: Option<String>,
}

impl WebSocketClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumer name reported to the broker. A random one is generated per
    /// connection otherwise.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }
}

#[async_trait]
impl BrokerClient for WebSocketClient {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let base_url = websocket_base_url(params.service_url())?;
        let consumer_name = self
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("pulsar-trigger-{}", Uuid::new_v4().simple()));

        debug!(%base_url, %consumer_name, "websocket connection prepared");
        Ok(Box::new(WebSocketConnection {
            base_url,
            auth_token: params.auth_token().to_string(),
            operation_timeout: params.operation_timeout(),
            consumer_name,
            closed: false,
        }))
    }
}

pub struct WebSocketConnection {
    base_url: String,
    auth_token: String,
    operation_timeout: Duration,
    consumer_name: String,
    closed: bool,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn subscribe(
        &mut self,
        params: &SubscriptionParameters,
    ) -> Result<Box<dyn Consumer>, SubscriptionError> {
        if self.closed {
            return Err(ConnectionError::Closed.into());
        }

        let url = consumer_url(&self.base_url, params, &self.consumer_name)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;
        if !self.auth_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.auth_token))
                .map_err(|_| SubscriptionError::Unauthorized("malformed token".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = match timeout(self.operation_timeout, connect_async(request)).await {
            Err(_) => return Err(SubscriptionError::TimedOut(self.operation_timeout)),
            Ok(Err(e)) => return Err(handshake_error(e, params.topic())),
            Ok(Ok(connected)) => connected,
        };

        info!(
            topic = params.topic(),
            subscription = params.subscription_name(),
            subscription_type = %params.subscription_type(),
            "subscribed over websocket"
        );
        Ok(Box::new(WebSocketConsumer {
            stream,
            operation_timeout: self.operation_timeout,
            topic: params.topic().to_string(),
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        if !self.closed {
            self.closed = true;
            debug!(base_url = %self.base_url, "websocket connection closed");
        }
        Ok(())
    }
}

pub struct WebSocketConsumer {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    operation_timeout: Duration,
    topic: String,
    closed: bool,
}

#[async_trait]
impl Consumer for WebSocketConsumer {
    async fn receive(&mut self) -> Result<Message, ReceiveError> {
        if self.closed {
            return Err(ReceiveError::Closed);
        }
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return decode_frame(text.as_str()),
                Some(Ok(WsMessage::Binary(_))) => {
                    return Err(ReceiveError::Transient("unexpected binary frame".into()));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "no reason given".to_string());
                    warn!(topic = %self.topic, %reason, "broker closed the consumer socket");
                    return Err(ReceiveError::Fatal(format!("socket closed by broker: {reason}")));
                }
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ReceiveError::Fatal(e.to_string())),
                None => return Err(ReceiveError::Fatal("socket stream ended".into())),
            }
        }
    }

    async fn acknowledge(&mut self, id: &MessageId) -> Result<(), AckError> {
        if self.closed {
            return Err(AckError::Closed);
        }
        let frame = serde_json::to_string(&AckFrame {
            message_id: id.as_str(),
        })
        .map_err(|e| AckError::Transport(e.to_string()))?;

        match timeout(self.operation_timeout, self.stream.send(WsMessage::text(frame))).await {
            Err(_) => Err(AckError::TimedOut(self.operation_timeout)),
            Ok(Err(e)) => Err(AckError::Transport(e.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match timeout(self.operation_timeout, self.stream.close(None)).await {
            Err(_) => Err(CloseError::TimedOut(self.operation_timeout)),
            Ok(Ok(()))
            | Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                debug!(topic = %self.topic, "websocket consumer closed");
                Ok(())
            }
            Ok(Err(e)) => Err(CloseError::Transport(e.to_string())),
        }
    }
}
