use bimtiles_common::{CodecError, DecodeError};
use bimtiles_index::{GlobalDataError, IndexError};

use crate::config::TilingConfigError;
use crate::sink::SinkError;

/// Failures while encoding a chunk payload.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("geometry tile: {0}")]
    Tile(#[from] CodecError),
    #[error("global chunk: {0}")]
    Global(#[from] GlobalDataError),
    #[error("JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that abort a conversion run. No manifest is written once one occurs.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to persist {name} after {attempts} attempts: {source}")]
    Seal {
        name: String,
        attempts: u32,
        #[source]
        source: SinkError,
    },
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("manifests failed validation: {0}")]
    Index(#[from] IndexError),
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("invalid tiling configuration: {0}")]
    Config(#[from] TilingConfigError),
}

impl From<CodecError> for ConvertError {
    fn from(err: CodecError) -> Self {
        Self::Encode(err.into())
    }
}

impl From<GlobalDataError> for ConvertError {
    fn from(err: GlobalDataError) -> Self {
        Self::Encode(err.into())
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.into())
    }
}
