use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::stats::LoopStats;

/// Where a consume loop is in its life.
///
/// `Idle → Running → Draining → Stopped`; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Idle,
    Running,
    Draining,
    Stopped,
}

impl LoopState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, LoopState::Stopped)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Draining => "draining",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What the loop shares with its owner: the one cancellation token, the
/// published state and the counters.
#[derive(Debug, Clone)]
pub struct LoopControl {
    token: CancellationToken,
    state: Arc<watch::Sender<LoopState>>,
    stats: Arc<LoopStats>,
}

impl LoopControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            token: CancellationToken::new(),
            state: Arc::new(state),
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new()
    }
}
