//! Background task that writes sealed chunks to the sink.
//!
//! The decoding loop never waits on IO: sealed payloads are queued on an
//! unbounded channel and written in seal order by a single task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ConvertError;
use crate::sink::{ChunkSink, SinkError};

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

#[derive(Debug)]
pub(crate) struct SealedChunk {
    pub name: String,
    pub data: Vec<u8>,
}

pub(crate) struct Persister {
    tx: mpsc::UnboundedSender<SealedChunk>,
    handle: JoinHandle<Result<usize, ConvertError>>,
}

impl Persister {
    /// Spawn the persister task. Must be called from within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn ChunkSink>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, sink, policy));
        Self { tx, handle }
    }

    /// Queue a chunk. Fails only once the task has stopped on an error;
    /// [`Persister::finish`] then reports that error.
    pub fn submit(&self, name: String, data: Vec<u8>) -> Result<(), ConvertError> {
        if self.is_stopped() {
            return Err(SinkError::Closed.into());
        }
        self.tx
            .send(SealedChunk { name, data })
            .map_err(|_| ConvertError::from(SinkError::Closed))
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }

    /// Close the queue and wait for every chunk to be written.
    pub async fn finish(self) -> Result<usize, ConvertError> {
        drop(self.tx);
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(SinkError::Rejected {
                name: "<persister>".into(),
                reason: err.to_string(),
            }
            .into()),
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<SealedChunk>,
    sink: Arc<dyn ChunkSink>,
    policy: RetryPolicy,
) -> Result<usize, ConvertError> {
    let mut written = 0;
    while let Some(chunk) = rx.recv().await {
        put_with_retry(sink.as_ref(), &chunk.name, &chunk.data, policy).await?;
        written += 1;
    }
    tracing::debug!(written, "persister drained");
    Ok(written)
}

/// Write one chunk, retrying with exponential backoff.
pub(crate) async fn put_with_retry(
    sink: &dyn ChunkSink,
    name: &str,
    data: &[u8],
    policy: RetryPolicy,
) -> Result<(), ConvertError> {
    let attempts = policy.retries.saturating_add(1);
    let mut delay = policy.backoff;
    let mut attempt = 1;
    loop {
        match sink.put(name, data).await {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= attempts => {
                tracing::warn!(chunk = name, attempts, error = %source, "giving up on chunk");
                return Err(ConvertError::Seal {
                    name: name.to_string(),
                    attempts,
                    source,
                });
            }
            Err(err) => {
                tracing::warn!(chunk = name, attempt, error = %err, "chunk write failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}
