//! Shared model for the tiling pipeline: ids, bounding volumes, elements and
//! the binary tile codec used by both the writer and the streaming cache.
//!
//! # Invariants
//! - Element ids are stable across conversion and runtime.
//! - One element's geometry is encoded as one contiguous record.

pub mod codec;
pub mod decode;
pub mod element;
pub mod naming;
pub mod types;

pub use codec::{CodecError, ElementGeometry, TileBuffer, TileContent, decode_tile};
pub use decode::{JsonLinesDecoder, ModelDecoder, count_json_lines};
pub use element::{CONTAINED_IN_STRUCTURE, DecodeError, Element, Geometry};
pub use naming::ChunkNaming;
pub use types::{BatchId, BoundingBox, ElementId, TileId};
