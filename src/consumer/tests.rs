use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{BrokerResources, ConsumeLoop, LoopControl, LoopExit, LoopOptions, LoopState};
use crate::broker::memory::MemoryBroker;
use crate::broker::{BrokerClient, ConnectionParameters, SubscriptionParameters};
use crate::emitter::{ChannelEmitter, Emitter, OutputRecord};
use crate::utils::error::{EmitError, ReceiveError};

const SUBSCRIPTION: &str = "n8n-pulsar";

/// Fails the first `failures` emits, accepts the rest.
struct FlakyEmitter {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyEmitter {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Emitter for FlakyEmitter {
    async fn emit(&self, _batch: Vec<OutputRecord>) -> Result<(), EmitError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(EmitError::Rejected("host is not ready".into()))
        } else {
            Ok(())
        }
    }
}

/// Blocks inside `emit` until released.
#[derive(Default)]
struct GatedEmitter {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Emitter for GatedEmitter {
    async fn emit(&self, _batch: Vec<OutputRecord>) -> Result<(), EmitError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

async fn resources(broker: &MemoryBroker, topic: &str) -> BrokerResources {
    let params = ConnectionParameters::new("memory://local", "", 30).unwrap();
    let mut connection = broker.connect(&params).await.unwrap();
    let consumer = connection
        .subscribe(&SubscriptionParameters::for_topic(topic).unwrap())
        .await
        .unwrap();
    BrokerResources {
        topic: topic.to_string(),
        connection,
        consumer,
    }
}

async fn spawn_loop(
    broker: &MemoryBroker,
    emitter: Arc<dyn Emitter>,
    options: LoopOptions,
) -> (LoopControl, JoinHandle<LoopExit>) {
    let control = LoopControl::new();
    let consume_loop = ConsumeLoop::new(
        resources(broker, "orders").await,
        emitter,
        control.clone(),
        options,
    );
    (control, tokio::spawn(consume_loop.run()))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_messages_are_emitted_then_acknowledged_in_order() {
    let broker = MemoryBroker::new();
    let (emitter, mut batches) = ChannelEmitter::channel(8);
    let (control, task) = spawn_loop(&broker, Arc::new(emitter), LoopOptions::default()).await;

    let ids: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|payload| broker.publish("orders", *payload))
        .collect();

    for expected in ["a", "b", "c"] {
        let batch = batches.recv().await.unwrap();
        assert_eq!(batch, vec![OutputRecord::new(expected)]);
    }
    wait_until(|| control.stats().snapshot().acknowledged == 3).await;
    assert_eq!(broker.acknowledged("orders", SUBSCRIPTION), ids);

    control.cancel();
    assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
    assert_eq!(control.state(), LoopState::Stopped);

    let stats = broker.stats();
    assert_eq!(stats.consumers_closed, 1);
    assert_eq!(stats.connections_closed, 1);
}

#[tokio::test]
async fn test_failed_emit_is_not_acknowledged_and_loop_continues() {
    let broker = MemoryBroker::new();
    let (control, task) =
        spawn_loop(&broker, Arc::new(FlakyEmitter::new(1)), LoopOptions::default()).await;

    broker.publish("orders", "rejected");
    let accepted = broker.publish("orders", "accepted");

    wait_until(|| control.stats().snapshot().acknowledged == 1).await;
    assert_eq!(broker.acknowledged("orders", SUBSCRIPTION), vec![accepted]);
    // the rejected one waits for redelivery
    assert_eq!(broker.pending_len("orders", SUBSCRIPTION), 1);

    let snapshot = control.stats().snapshot();
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.emit_failures, 1);
    assert_eq!(snapshot.emitted, 1);
    assert_eq!(control.state(), LoopState::Running);

    control.cancel();
    assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
}

#[tokio::test]
async fn test_rejected_message_is_redelivered_after_consumer_closes() {
    let broker = MemoryBroker::new();
    let (control, task) =
        spawn_loop(&broker, Arc::new(FlakyEmitter::new(1)), LoopOptions::default()).await;

    let rejected = broker.publish("orders", "rejected");
    wait_until(|| control.stats().snapshot().emit_failures == 1).await;
    // no ack timeout: the message stays pending while the consumer lives
    assert_eq!(broker.pending_len("orders", SUBSCRIPTION), 1);
    assert_eq!(broker.backlog_len("orders", SUBSCRIPTION), 0);

    control.cancel();
    assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
    assert_eq!(broker.backlog_len("orders", SUBSCRIPTION), 1);

    let mut next = resources(&broker, "orders").await;
    let message = next.consumer.receive().await.unwrap();
    assert_eq!(message.id, rejected);
    assert_eq!(message.redelivery_count, 1);
}

#[tokio::test]
async fn test_acknowledge_failure_does_not_stop_the_loop() {
    let broker = MemoryBroker::new();
    broker.set_reject_acks(true);
    let (control, task) =
        spawn_loop(&broker, Arc::new(FlakyEmitter::new(0)), LoopOptions::default()).await;

    broker.publish("orders", "first");
    wait_until(|| control.stats().snapshot().ack_failures == 1).await;

    broker.set_reject_acks(false);
    let second = broker.publish("orders", "second");
    wait_until(|| control.stats().snapshot().acknowledged == 1).await;
    assert_eq!(broker.acknowledged("orders", SUBSCRIPTION), vec![second]);
    assert_eq!(control.state(), LoopState::Running);

    control.cancel();
    assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
}

#[tokio::test]
async fn test_fatal_receive_error_stops_and_closes_once() {
    let broker = MemoryBroker::new();
    broker.inject_receive_error(ReceiveError::Fatal("broker went away".into()));
    let (control, task) =
        spawn_loop(&broker, Arc::new(FlakyEmitter::new(0)), LoopOptions::default()).await;

    let exit = task.await.unwrap();
    assert_eq!(exit, LoopExit::Fatal(ReceiveError::Fatal("broker went away".into())));
    assert_eq!(control.state(), LoopState::Stopped);
    assert!(!control.is_cancelled());

    let stats = broker.stats();
    assert_eq!(stats.consumers_closed, 1);
    assert_eq!(stats.connections_closed, 1);
}

#[tokio::test]
async fn test_dropped_connection_is_fatal() {
    let broker = MemoryBroker::new();
    let (control, task) =
        spawn_loop(&broker, Arc::new(FlakyEmitter::new(0)), LoopOptions::default()).await;
    wait_until(|| control.state() == LoopState::Running).await;

    broker.drop_connections();
    assert!(matches!(task.await.unwrap(), LoopExit::Fatal(_)));
    assert_eq!(control.state(), LoopState::Stopped);
}

#[tokio::test]
async fn test_cancel_unblocks_a_waiting_receive() {
    let broker = MemoryBroker::new();
    let (control, task) =
        spawn_loop(&broker, Arc::new(FlakyEmitter::new(0)), LoopOptions::default()).await;
    wait_until(|| control.state() == LoopState::Running).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    control.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("loop did not observe cancellation")
        .unwrap();
    assert_eq!(exit, LoopExit::Cancelled);
    assert_eq!(control.stats().snapshot().received, 0);
    assert_eq!(broker.stats().open_consumers(), 0);
}

#[tokio::test]
async fn test_cancelled_before_run_emits_nothing() {
    let broker = MemoryBroker::new();
    let (emitter, mut batches) = ChannelEmitter::channel(8);
    let control = LoopControl::new();
    let consume_loop = ConsumeLoop::new(
        resources(&broker, "orders").await,
        Arc::new(emitter),
        control.clone(),
        LoopOptions::default(),
    );
    broker.publish("orders", "never");

    control.cancel();
    assert_eq!(consume_loop.run().await, LoopExit::Cancelled);
    assert!(batches.try_recv().is_err());
    assert_eq!(broker.backlog_len("orders", SUBSCRIPTION), 1);
}

#[tokio::test]
async fn test_emit_in_flight_is_acknowledged_before_stopping() {
    let broker = MemoryBroker::new();
    let emitter = Arc::new(GatedEmitter::default());
    let (control, task) = spawn_loop(&broker, emitter.clone(), LoopOptions::default()).await;

    let id = broker.publish("orders", "in-flight");
    emitter.entered.notified().await;
    control.cancel();
    emitter.release.notify_one();

    assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
    assert_eq!(broker.acknowledged("orders", SUBSCRIPTION), vec![id]);
}

#[tokio::test]
async fn test_receive_timeout_keeps_looping() {
    let broker = MemoryBroker::new();
    let options = LoopOptions {
        receive_timeout: Some(Duration::from_millis(10)),
        ..LoopOptions::default()
    };
    let (control, task) = spawn_loop(&broker, Arc::new(FlakyEmitter::new(0)), options).await;

    // several timeouts elapse before anything is published
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(control.state(), LoopState::Running);

    broker.publish("orders", "late");
    wait_until(|| control.stats().snapshot().acknowledged == 1).await;

    control.cancel();
    assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
}

#[tokio::test]
async fn test_transient_receive_error_is_retried() {
    let broker = MemoryBroker::new();
    broker.inject_receive_error(ReceiveError::Transient("hiccup".into()));
    let options = LoopOptions {
        retry_backoff: Duration::from_millis(10),
        ..LoopOptions::default()
    };
    let (control, task) = spawn_loop(&broker, Arc::new(FlakyEmitter::new(0)), options).await;

    broker.publish("orders", "after-hiccup");
    wait_until(|| control.stats().snapshot().acknowledged == 1).await;
    assert_eq!(control.stats().snapshot().receive_errors, 1);

    control.cancel();
    assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
}

#[test]
fn test_loop_state_display() {
    assert_eq!(LoopState::default(), LoopState::Idle);
    assert_eq!(LoopState::Draining.to_string(), "draining");
    assert!(LoopState::Stopped.is_stopped());
    assert!(!LoopState::Running.is_stopped());
}
