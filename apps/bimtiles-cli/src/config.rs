use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use bimtiles_convert::TilingConfig;
use bimtiles_stream::CachePolicy;

/// Contents of the YAML configuration file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub tiling: TilingConfig,
    pub streaming: CachePolicy,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.tiling.validate().context("invalid tiling configuration")?;
        self.streaming.validate().context("invalid streaming configuration")?;
        Ok(())
    }
}
