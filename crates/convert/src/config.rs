use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Invalid tiling configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TilingConfigError {
    #[error("{0} must be positive")]
    ZeroLimit(&'static str),
}

/// Tiling limits and persistence behaviour for one conversion run.
///
/// Keys use the camelCase names of the configuration surface
/// (`minGeometrySize`, `minAssetsSize`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TilingConfig {
    /// A geometry tile is sealed once its byte size reaches this value.
    pub min_geometry_size: usize,
    /// A property batch is sealed once it holds this many elements.
    pub min_assets_size: usize,
    /// Emit property batches alongside geometry.
    pub properties: bool,
    /// Retries after the first failed attempt to persist a chunk.
    pub seal_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff_ms: u64,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            min_geometry_size: 4 * 1024 * 1024,
            min_assets_size: 1000,
            properties: true,
            seal_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl TilingConfig {
    pub fn validate(&self) -> Result<(), TilingConfigError> {
        if self.min_geometry_size == 0 {
            return Err(TilingConfigError::ZeroLimit("minGeometrySize"));
        }
        if self.min_assets_size == 0 {
            return Err(TilingConfigError::ZeroLimit("minAssetsSize"));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
