//! Destinations for sealed chunks.
//!
//! # Implementations
//!
//! - [`DirectorySink`]: one file per chunk under a root directory
//! - [`MemorySink`]: in-memory map, shared between clones

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

/// Errors reported by a [`ChunkSink`].
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk {name} rejected: {reason}")]
    Rejected { name: String, reason: String },
    #[error("chunk persister is no longer running")]
    Closed,
}

/// Future type for [`ChunkSink::put`].
pub type PutFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// A store that accepts named, immutable chunks.
///
/// Writing the same name twice with the same bytes must succeed, so that a
/// retried put after a partial failure is harmless.
pub trait ChunkSink: Send + Sync {
    fn put<'a>(&'a self, name: &'a str, data: &'a [u8]) -> PutFuture<'a>;
}

/// Writes each chunk to `<root>/<name>`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Create the sink, creating `root` if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ChunkSink for DirectorySink {
    fn put<'a>(&'a self, name: &'a str, data: &'a [u8]) -> PutFuture<'a> {
        Box::pin(async move {
            if name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(SinkError::Rejected {
                    name: name.to_string(),
                    reason: "chunk names must be plain file names".into(),
                });
            }
            // Write then rename so readers never observe a half-written chunk.
            let path = self.root.join(name);
            let tmp = self.root.join(format!(".{name}.tmp"));
            tokio::fs::write(&tmp, data).await?;
            tokio::fs::rename(&tmp, &path).await?;
            tracing::trace!(chunk = name, bytes = data.len(), "chunk written");
            Ok(())
        })
    }
}

/// Keeps chunks in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    chunks: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Chunk names in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a copy of every stored chunk.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChunkSink for MemorySink {
    fn put<'a>(&'a self, name: &'a str, data: &'a [u8]) -> PutFuture<'a> {
        Box::pin(async move {
            self.chunks
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), data.to_vec());
            Ok(())
        })
    }
}
