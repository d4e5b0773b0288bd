//! Tile Writer: turns a stream of decoded elements into geometry tiles,
//! property batches, a global chunk and the two manifests.
//!
//! # Invariants
//! - Every element lands in exactly one tile and, with properties enabled,
//!   exactly one batch.
//! - A tile is sealed as soon as its uncompressed size reaches
//!   `minGeometrySize`; a batch once it holds `minAssetsSize` elements.
//! - Manifests are written only after every chunk they reference has been
//!   persisted. A failed run writes no manifest.

pub mod config;
mod error;
mod persister;
pub mod sink;
mod writer;

pub use config::{TilingConfig, TilingConfigError};
pub use error::{ConvertError, EncodeError};
pub use sink::{ChunkSink, DirectorySink, MemorySink, PutFuture, SinkError};
pub use writer::{
    ConversionEvent, ConversionOutput, SealedBatch, SealedTile, TileWriter, convert,
};
