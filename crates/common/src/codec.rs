//! Binary layout of geometry tiles.
//!
//! A tile is a zstd frame wrapping a sequence of element records:
//! ```text
//! u32 element id | u32 vertex count | u32 normal count | u32 index count
//! [f32; 3] * vertex count      positions
//! [f32; 3] * normal count      normals
//! u32 * index count            indices
//! ```
//! Scalars are little endian. Manifest offsets point into the decompressed
//! record stream, so one element's geometry never spans two tiles.

use std::io::{Read, Write};

use crate::element::Geometry;
use crate::types::{ElementId, TileId};

/// Size of the fixed part of a record.
pub const RECORD_HEADER_LEN: usize = 16;

const ZSTD_LEVEL: i32 = 3;

/// Errors from encoding or decoding tile payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tile payload truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("tile payload exceeds {limit} bytes once decompressed")]
    TooLarge { limit: usize },
}

/// Geometry of one element as carried by a resident tile.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementGeometry {
    pub id: ElementId,
    pub geometry: Geometry,
}

/// Decoded, displayable form of a tile. Handed to the scene consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct TileContent {
    pub tile: TileId,
    pub elements: Vec<ElementGeometry>,
}

impl TileContent {
    pub fn element_ids(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.elements.iter().map(|e| e.id)
    }

    pub fn get(&self, id: ElementId) -> Option<&Geometry> {
        self.elements.iter().find(|e| e.id == id).map(|e| &e.geometry)
    }

    /// Bytes of geometry held in memory, header overhead included.
    pub fn byte_size(&self) -> usize {
        self.elements.iter().map(|e| e.geometry.byte_len()).sum()
    }
}

/// Open, uncompressed tile being filled by the writer.
#[derive(Debug, Default)]
pub struct TileBuffer {
    bytes: Vec<u8>,
    elements: Vec<ElementId>,
}

impl TileBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one element record. Returns its `(offset, length)` in the buffer.
    pub fn append(&mut self, id: ElementId, geometry: &Geometry) -> (u64, u64) {
        let offset = self.bytes.len();
        self.bytes.reserve(geometry.byte_len());
        self.bytes.extend_from_slice(&id.0.to_le_bytes());
        for count in [
            geometry.positions.len(),
            geometry.normals.len(),
            geometry.indices.len(),
        ] {
            self.bytes.extend_from_slice(&(count as u32).to_le_bytes());
        }
        extend_le_f32(&mut self.bytes, bytemuck::cast_slice(&geometry.positions));
        extend_le_f32(&mut self.bytes, bytemuck::cast_slice(&geometry.normals));
        if cfg!(target_endian = "little") {
            self.bytes.extend_from_slice(bytemuck::cast_slice(&geometry.indices));
        } else {
            for i in &geometry.indices {
                self.bytes.extend_from_slice(&i.to_le_bytes());
            }
        }
        self.elements.push(id);
        (offset as u64, (self.bytes.len() - offset) as u64)
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[ElementId] {
        &self.elements
    }

    /// Compress the record stream, leaving the buffer empty for the next tile.
    pub fn seal(&mut self) -> Result<(Vec<ElementId>, Vec<u8>), CodecError> {
        let bytes = std::mem::take(&mut self.bytes);
        let elements = std::mem::take(&mut self.elements);
        let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
        encoder.write_all(&bytes)?;
        Ok((elements, encoder.finish()?))
    }
}

fn extend_le_f32(out: &mut Vec<u8>, values: &[f32]) {
    if cfg!(target_endian = "little") {
        out.extend_from_slice(bytemuck::cast_slice(values));
    } else {
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// Decompress and parse a persisted tile.
///
/// `limit` bounds the decompressed record stream; the manifest lengths of the
/// tile's elements sum to exactly that size.
pub fn decode_tile(tile: TileId, data: &[u8], limit: usize) -> Result<TileContent, CodecError> {
    let decoder = zstd::Decoder::new(data)?;
    let mut raw = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut raw)?;
    if raw.len() > limit {
        return Err(CodecError::TooLarge { limit });
    }

    let mut reader = RecordReader { raw: &raw, pos: 0 };
    let mut elements = Vec::new();
    while reader.pos < raw.len() {
        let id = ElementId(reader.u32()?);
        let vertex_count = reader.u32()? as usize;
        let normal_count = reader.u32()? as usize;
        let index_count = reader.u32()? as usize;
        let positions = reader.vec3s(vertex_count)?;
        let normals = reader.vec3s(normal_count)?;
        let indices = reader.u32s(index_count)?;
        elements.push(ElementGeometry {
            id,
            geometry: Geometry {
                positions,
                normals,
                indices,
            },
        });
    }
    tracing::trace!(%tile, elements = elements.len(), "decoded tile");
    Ok(TileContent { tile, elements })
}

struct RecordReader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.raw.len())
            .ok_or(CodecError::Truncated { offset: self.pos })?;
        let slice = &self.raw[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u32s(&mut self, count: usize) -> Result<Vec<u32>, CodecError> {
        let bytes = self.take(count * 4)?;
        let mut out: Vec<u32> = bytemuck::pod_collect_to_vec(bytes);
        if cfg!(target_endian = "big") {
            out.iter_mut().for_each(|v| *v = u32::from_le(*v));
        }
        Ok(out)
    }

    fn vec3s(&mut self, count: usize) -> Result<Vec<[f32; 3]>, CodecError> {
        let bytes = self.take(count * 12)?;
        let mut out: Vec<[f32; 3]> = bytemuck::pod_collect_to_vec(bytes);
        if cfg!(target_endian = "big") {
            for v in out.iter_mut().flatten() {
                *v = f32::from_bits(u32::from_le(v.to_bits()));
            }
        }
        Ok(out)
    }
}
