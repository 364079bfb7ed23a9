//! Lifecycle controller
//!
//! `LifecycleController` opens the connection and the subscription, moves
//! both into a [`ConsumeLoop`] running on its own task and hands back a
//! [`ShutdownHandle`]. The handle is also available before `start`, so a
//! host can cancel a start that is still connecting.
//!
//! Concurrency notes:
//! - one `CancellationToken` drives everything; `stop` cancels it, the loop
//!   and a pending `start` observe it
//! - the loop is the only writer of `Running`/`Draining`; `start` writes
//!   `Stopped` only when it fails before the loop exists; the supervisor
//!   writes `Stopped` if the loop task panicked
//! - `stop` waits on the state channel, so any number of concurrent callers
//!   return once teardown has finished (or the grace period is over)
//! - a `start` future dropped before it finishes still closes the connection
//!   it opened and writes `Stopped`, so a later `stop` does not hang

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, Connection, ConnectionParameters, SubscriptionParameters};
use crate::consumer::consume_loop::close_connection;
use crate::consumer::{
    BrokerResources, ConsumeLoop, LoopControl, LoopOptions, LoopState, LoopStatsSnapshot,
};
use crate::emitter::Emitter;
use crate::utils::error::StartupError;

/// Settings of one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleOptions {
    /// How long `stop` waits for teardown before giving up.
    pub shutdown_grace: Duration,
    pub loop_options: LoopOptions,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
            loop_options: LoopOptions::default(),
        }
    }
}

/// Result of [`ShutdownHandle::stop`]. Hosts are free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Teardown finished within the grace period.
    Stopped,
    /// The loop had already stopped (earlier stop or fatal error).
    AlreadyStopped,
    /// `start` was never called; nothing to tear down.
    NotStarted,
    /// Teardown is still running in the background.
    GraceElapsed,
}

#[derive(Debug)]
struct Shared {
    control: LoopControl,
    starting: AtomicBool,
    shutdown_requested: AtomicBool,
    grace: Duration,
}

/// Stops the trigger. Cheap to clone; every clone controls the same loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Request shutdown and wait for teardown, at most for the grace period.
    ///
    /// Idempotent and safe to call concurrently: only the first call
    /// cancels, every call waits for the same teardown.
    pub async fn stop(&self) -> StopOutcome {
        let control = &self.shared.control;
        let first_request = !self.shared.shutdown_requested.swap(true, Ordering::SeqCst);
        control.cancel();

        if control.state().is_stopped() {
            return StopOutcome::AlreadyStopped;
        }
        if !self.shared.starting.load(Ordering::SeqCst) {
            // start() will see the token and bail out on its own
            return StopOutcome::NotStarted;
        }
        if first_request {
            info!("shutdown requested");
        }

        let mut state = control.watch_state();
        match timeout(self.shared.grace, state.wait_for(LoopState::is_stopped)).await {
            Ok(_) => StopOutcome::Stopped,
            Err(_) => {
                warn!(
                    grace = ?self.shared.grace,
                    "teardown did not finish within the grace period"
                );
                StopOutcome::GraceElapsed
            }
        }
    }

    /// Wait until the loop stops on its own or through `stop`.
    pub async fn stopped(&self) {
        let mut state = self.shared.control.watch_state();
        let _ = state.wait_for(LoopState::is_stopped).await;
    }

    pub fn state(&self) -> LoopState {
        self.shared.control.state()
    }

    pub fn stats(&self) -> LoopStatsSnapshot {
        self.shared.control.stats().snapshot()
    }
}

/// Builds the broker resources and runs the consume loop. Single use.
#[derive(Debug)]
pub struct LifecycleController {
    handle: ShutdownHandle,
    options: LifecycleOptions,
}

impl LifecycleController {
    pub fn new(options: LifecycleOptions) -> Self {
        Self {
            handle: ShutdownHandle {
                shared: Arc::new(Shared {
                    control: LoopControl::new(),
                    starting: AtomicBool::new(false),
                    shutdown_requested: AtomicBool::new(false),
                    grace: options.shutdown_grace,
                }),
            },
            options,
        }
    }

    /// Handle usable before and during `start`.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Connect, subscribe and spawn the loop.
    ///
    /// Fails fast with [`StartupError`] when the connection or subscription
    /// cannot be set up, closing whatever was already opened. A `stop`
    /// issued while this is in progress makes it fail with
    /// [`StartupError::Cancelled`].
    pub async fn start<C>(
        self,
        client: &C,
        connection_params: ConnectionParameters,
        subscription_params: SubscriptionParameters,
        emitter: Arc<dyn Emitter>,
    ) -> Result<ShutdownHandle, StartupError>
    where
        C: BrokerClient + ?Sized,
    {
        let shared = self.handle.shared.clone();
        let control = shared.control.clone();
        shared.starting.store(true, Ordering::SeqCst);
        let token = control.token().clone();
        let mut guard = StartGuard {
            control: control.clone(),
            connection: None,
            armed: true,
        };

        if token.is_cancelled() {
            return Err(StartupError::Cancelled);
        }

        info!(
            service_url = connection_params.service_url(),
            topic = subscription_params.topic(),
            subscription = subscription_params.subscription_name(),
            subscription_type = %subscription_params.subscription_type(),
            "starting trigger"
        );

        let connection = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(StartupError::Cancelled),
            connected = client.connect(&connection_params) => match connected {
                Ok(connection) => connection,
                Err(err) => {
                    error!(error = %err, "failed to connect to broker");
                    return Err(err.into());
                }
            },
        };
        let connection = guard.connection.insert(connection);

        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => Err(StartupError::Cancelled),
            subscribed = connection.subscribe(&subscription_params) => {
                subscribed.map_err(StartupError::from)
            }
        };
        let consumer = match subscribed {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = %err, "failed to subscribe");
                if let Some(mut connection) = guard.connection.take() {
                    close_connection(connection.as_mut()).await;
                }
                return Err(err);
            }
        };
        let Some(connection) = guard.release() else {
            return Err(StartupError::Cancelled);
        };

        let consume_loop = ConsumeLoop::new(
            BrokerResources {
                topic: subscription_params.topic().to_string(),
                connection,
                consumer,
            },
            emitter,
            control.clone(),
            self.options.loop_options.clone(),
        );

        let task = tokio::spawn(consume_loop.run());
        tokio::spawn(async move {
            if let Err(err) = task.await {
                error!(error = %err, "consume loop task failed");
                control.set_state(LoopState::Stopped);
            }
        });

        Ok(self.handle)
    }
}

/// Undoes a `start` that returns early or is dropped mid-way.
///
/// While armed, dropping it writes `Stopped`. A connection still held is
/// closed first on a background task, since `Drop` cannot await.
struct StartGuard {
    control: LoopControl,
    connection: Option<Box<dyn Connection>>,
    armed: bool,
}

impl StartGuard {
    /// Hand the connection over to the consume loop. Stays armed when
    /// there is nothing to hand over.
    fn release(&mut self) -> Option<Box<dyn Connection>> {
        let connection = self.connection.take();
        self.armed = connection.is_none();
        connection
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(mut connection) = self.connection.take() else {
            self.control.set_state(LoopState::Stopped);
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                warn!("start abandoned while subscribing, closing connection");
                let control = self.control.clone();
                runtime.spawn(async move {
                    close_connection(connection.as_mut()).await;
                    control.set_state(LoopState::Stopped);
                });
            }
            Err(_) => {
                warn!("start abandoned outside a runtime, connection dropped unclosed");
                self.control.set_state(LoopState::Stopped);
            }
        }
    }
}
