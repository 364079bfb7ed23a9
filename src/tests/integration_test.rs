use std::sync::Arc;
use std::time::Duration;

use super::mock_pulsar::{self, AfterFrames};
use crate::broker::websocket::WebSocketClient;
use crate::config::Settings;
use crate::consumer::LoopState;
use crate::emitter::{ChannelEmitter, OutputRecord};
use crate::{LifecycleController, StopOutcome};

#[tokio::test]
async fn integration_trigger_end_to_end() {
    let mut server = mock_pulsar::start(
        Some("secret"),
        vec![
            mock_pulsar::frame("CAAQAA==", br#"{"id":1}"#),
            mock_pulsar::frame("CAAQAQ==", br#"{"id":2}"#),
        ],
        AfterFrames::CollectAcks,
    )
    .await;

    let mut settings = Settings::default();
    settings.broker.service_url = server.url.clone();
    settings.broker.auth_token = "secret".into();
    settings.subscription.topic = "persistent://public/default/orders".into();

    let (emitter, mut batches) = ChannelEmitter::channel(4);
    let handle = LifecycleController::new(settings.lifecycle_options())
        .start(
            &WebSocketClient::new(),
            settings.connection_parameters().unwrap(),
            settings.subscription_parameters().unwrap(),
            Arc::new(emitter),
        )
        .await
        .expect("trigger start");

    let handshake = (&mut server.handshake).await.unwrap();
    assert!(
        handshake
            .path
            .starts_with("/ws/v2/consumer/persistent/public/default/orders/n8n-pulsar?")
    );

    for expected in [r#"{"id":1}"#, r#"{"id":2}"#] {
        let batch = batches.recv().await.unwrap();
        assert_eq!(batch, vec![OutputRecord::new(expected)]);
    }

    let mut acked = Vec::new();
    for _ in 0..2 {
        let ack = tokio::time::timeout(Duration::from_secs(2), server.acks.recv())
            .await
            .expect("ack in time")
            .unwrap();
        let ack: serde_json::Value = serde_json::from_str(&ack).unwrap();
        acked.push(ack["messageId"].as_str().unwrap().to_string());
    }
    assert_eq!(acked, vec!["CAAQAA==", "CAAQAQ=="]);

    assert_eq!(handle.stop().await, StopOutcome::Stopped);
    assert_eq!(handle.state(), LoopState::Stopped);
    assert_eq!(handle.stats().acknowledged, 2);
}

#[tokio::test]
async fn integration_broker_closing_socket_stops_trigger() {
    let server = mock_pulsar::start(None, vec![], AfterFrames::Close).await;

    let mut settings = Settings::default();
    settings.broker.service_url = server.url.clone();
    settings.subscription.topic = "orders".into();

    let (emitter, _batches) = ChannelEmitter::channel(1);
    let handle = LifecycleController::new(settings.lifecycle_options())
        .start(
            &WebSocketClient::new(),
            settings.connection_parameters().unwrap(),
            settings.subscription_parameters().unwrap(),
            Arc::new(emitter),
        )
        .await
        .expect("trigger start");

    tokio::time::timeout(Duration::from_secs(2), handle.stopped())
        .await
        .expect("trigger stops after the broker goes away");
    assert_eq!(handle.stop().await, StopOutcome::AlreadyStopped);
}
