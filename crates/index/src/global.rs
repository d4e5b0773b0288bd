//! The always-resident global chunk: whole-model metadata stored as CBOR+zstd.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use uuid::Uuid;

use bimtiles_common::{BoundingBox, ElementId};

/// Current schema version of the global chunk.
pub const GLOBAL_SCHEMA_VERSION: u32 = 1;

/// Errors from encoding or decoding the global chunk.
#[derive(Debug, thiserror::Error)]
pub enum GlobalDataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("schema version mismatch: chunk has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
}

/// Whole-model metadata written once per conversion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalData {
    pub schema_version: u32,
    pub model: String,
    /// Identifies the conversion run that produced the chunk set.
    pub run_id: Uuid,
    pub element_count: u64,
    pub bounds: Option<BoundingBox>,
    pub type_counts: BTreeMap<String, u64>,
    /// Spatial container id -> elements contained in it.
    pub spatial_structure: BTreeMap<ElementId, Vec<ElementId>>,
}

impl GlobalData {
    pub fn new(model: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            schema_version: GLOBAL_SCHEMA_VERSION,
            model: model.into(),
            run_id,
            element_count: 0,
            bounds: None,
            type_counts: BTreeMap::new(),
            spatial_structure: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, GlobalDataError> {
        let mut cbor = Vec::new();
        ciborium::into_writer(self, &mut cbor)
            .map_err(|e| GlobalDataError::CborEncode(e.to_string()))?;
        let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
        encoder.write_all(&cbor)?;
        Ok(encoder.finish()?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, GlobalDataError> {
        let mut decoder = zstd::Decoder::new(data)?;
        let mut cbor = Vec::new();
        decoder.read_to_end(&mut cbor)?;
        let global: GlobalData = ciborium::from_reader(cbor.as_slice())
            .map_err(|e| GlobalDataError::CborDecode(e.to_string()))?;
        if global.schema_version != GLOBAL_SCHEMA_VERSION {
            return Err(GlobalDataError::SchemaMismatch {
                file_version: global.schema_version,
                expected_version: GLOBAL_SCHEMA_VERSION,
            });
        }
        Ok(global)
    }
}
