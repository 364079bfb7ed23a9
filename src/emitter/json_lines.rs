use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use super::{Emitter, OutputRecord};
use crate::utils::error::EmitError;

/// Writes every record as one JSON object per line and flushes after each
/// batch.
#[derive(Debug)]
pub struct JsonLinesEmitter<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesEmitter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesEmitter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> Emitter for JsonLinesEmitter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn emit(&self, batch: Vec<OutputRecord>) -> Result<(), EmitError> {
        let mut buf = Vec::new();
        for record in &batch {
            serde_json::to_writer(&mut buf, record).map_err(|e| EmitError::Write(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&buf)
            .await
            .map_err(|e| EmitError::Write(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| EmitError::Write(e.to_string()))
    }
}
