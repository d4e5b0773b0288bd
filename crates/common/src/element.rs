use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{BoundingBox, ElementId};

/// Relation name linking an element to the spatial container holding it.
pub const CONTAINED_IN_STRUCTURE: &str = "ContainedInStructure";

/// Errors raised while turning source bytes into [`Element`]s.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed element on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("element {id} has invalid geometry: {reason}")]
    InvalidGeometry { id: ElementId, reason: String },
    #[error("element {0} appears more than once in the model")]
    DuplicateElement(ElementId),
}

/// Triangle geometry of a single element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub positions: Vec<[f32; 3]>,
    #[serde(default)]
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

impl Geometry {
    /// Bytes this geometry occupies inside a tile, record header included.
    pub fn byte_len(&self) -> usize {
        crate::codec::RECORD_HEADER_LEN
            + std::mem::size_of_val(self.positions.as_slice())
            + std::mem::size_of_val(self.normals.as_slice())
            + std::mem::size_of_val(self.indices.as_slice())
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Check the invariants the tile codec relies on.
    pub fn validate(&self) -> Result<(), String> {
        if !self.normals.is_empty() && self.normals.len() != self.positions.len() {
            return Err(format!(
                "{} normals for {} positions",
                self.normals.len(),
                self.positions.len()
            ));
        }
        if self.indices.len() % 3 != 0 {
            return Err(format!("index count {} is not a multiple of 3", self.indices.len()));
        }
        let vertex_count = self.positions.len() as u64;
        if let Some(bad) = self.indices.iter().find(|&&i| u64::from(i) >= vertex_count) {
            return Err(format!("index {bad} out of range for {vertex_count} vertices"));
        }
        let finite = |v: &[f32; 3]| v.iter().all(|c| c.is_finite());
        if !self.positions.iter().all(finite) || !self.normals.iter().all(finite) {
            return Err("non-finite coordinate".into());
        }
        Ok(())
    }
}

/// One addressable unit of the source model. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub type_name: String,
    pub geometry: Geometry,
    /// Falls back to the geometry's own bounds when the source omits it.
    #[serde(default)]
    pub bounds: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<[f32; 4]>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<ElementId>>,
}

impl Element {
    pub fn new(id: ElementId, type_name: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            geometry,
            bounds: None,
            color: None,
            properties: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_relation(mut self, name: impl Into<String>, target: ElementId) -> Self {
        self.relations.entry(name.into()).or_default().push(target);
        self
    }

    /// Bounding volume recorded in the manifest.
    ///
    /// Elements without geometry and without explicit bounds get a
    /// degenerate box at the origin, which keeps the manifest finite.
    pub fn bounding_volume(&self) -> BoundingBox {
        self.spatial_bounds()
            .unwrap_or(BoundingBox::new(glam::Vec3::ZERO, glam::Vec3::ZERO))
    }

    /// Explicit or geometric bounds, `None` for elements with no extent.
    pub fn spatial_bounds(&self) -> Option<BoundingBox> {
        self.bounds
            .or_else(|| BoundingBox::from_points(&self.geometry.positions))
    }

    /// Validate geometry and bounds, returning the decode failure the writer surfaces.
    pub fn validate(&self) -> Result<(), DecodeError> {
        self.geometry
            .validate()
            .map_err(|reason| DecodeError::InvalidGeometry { id: self.id, reason })?;
        if let Some(bounds) = self.bounds {
            if !bounds.is_finite() || bounds.is_empty() {
                return Err(DecodeError::InvalidGeometry {
                    id: self.id,
                    reason: "explicit bounds are empty or non-finite".into(),
                });
            }
        }
        Ok(())
    }
}
