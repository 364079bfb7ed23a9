//! The `consumer` module holds the consume loop and the state it shares
//! with its owner.

pub mod consume_loop;
pub mod state;
pub mod stats;

pub use consume_loop::{BrokerResources, ConsumeLoop, LoopExit, LoopOptions};
pub use state::{LoopControl, LoopState};
pub use stats::{LoopStats, LoopStatsSnapshot};

#[cfg(test)]
mod tests;
