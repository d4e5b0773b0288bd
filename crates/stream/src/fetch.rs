//! Byte sources for geometry tiles.
//!
//! - [`DirectoryFetcher`]: reads chunks from a directory with tokio fs
//! - [`MemoryFetcher`]: serves chunks from an in-memory map

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use bimtiles_common::CodecError;

/// Errors from fetching or decoding a tile. Absorbed by the cache.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("chunk {0} not found")]
    NotFound(String),
    #[error("IO error reading {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("chunk {name} is not a valid tile: {source}")]
    Decode {
        name: String,
        #[source]
        source: CodecError,
    },
    #[error("chunk {name} does not hold the elements the index expects")]
    Mismatch { name: String },
}

/// Future type for [`FetchBackend::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send + 'a>>;

/// Where tile bytes come from.
pub trait FetchBackend: Send + Sync {
    fn fetch<'a>(&'a self, name: &'a str) -> FetchFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FetchBackend for DirectoryFetcher {
    fn fetch<'a>(&'a self, name: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            match tokio::fs::read(self.root.join(name)).await {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(FetchError::NotFound(name.to_string()))
                }
                Err(source) => Err(FetchError::Io {
                    name: name.to_string(),
                    source,
                }),
            }
        })
    }
}

/// Serves chunks from memory. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    chunks: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            chunks: Arc::new(RwLock::new(chunks.into_iter().collect())),
        }
    }

    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        self.chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), data);
    }

    pub fn remove(&self, name: &str) -> Option<Vec<u8>> {
        self.chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

impl FetchBackend for MemoryFetcher {
    fn fetch<'a>(&'a self, name: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            self.chunks
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(name.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_fetcher_serves_inserted_chunks() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("a", vec![1, 2, 3]);
        assert_eq!(fetcher.fetch("a").await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            fetcher.fetch("b").await,
            Err(FetchError::NotFound(name)) if name == "b"
        ));
    }

    #[tokio::test]
    async fn directory_fetcher_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tile"), b"bytes").unwrap();
        let fetcher = DirectoryFetcher::new(dir.path());
        assert_eq!(fetcher.fetch("tile").await.unwrap(), b"bytes");
        assert!(matches!(
            fetcher.fetch("missing").await,
            Err(FetchError::NotFound(_))
        ));
    }
}
