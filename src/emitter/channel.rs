use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Emitter, OutputRecord};
use crate::utils::error::EmitError;

/// Forwards batches into a bounded channel.
///
/// A full channel suspends the loop until the host catches up; a dropped
/// receiver turns every emit into [`EmitError::Closed`].
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    sender: mpsc::Sender<Vec<OutputRecord>>,
}

impl ChannelEmitter {
    pub fn new(sender: mpsc::Sender<Vec<OutputRecord>>) -> Self {
        Self { sender }
    }

    /// Emitter plus the receiving end, with room for `capacity` batches.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<OutputRecord>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Emitter for ChannelEmitter {
    async fn emit(&self, batch: Vec<OutputRecord>) -> Result<(), EmitError> {
        self.sender.send(batch).await.map_err(|_| EmitError::Closed)
    }
}
