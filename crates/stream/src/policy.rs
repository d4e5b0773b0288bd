use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Milliseconds on the caller's clock.
pub type Millis = u64;

/// Invalid streaming configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("visibilityThreshold must be finite and non-negative, got {0}")]
    Threshold(f32),
    #[error("maxHiddenTime ({max_hidden} ms) exceeds maxLostTime ({max_lost} ms)")]
    HiddenExceedsLost { max_hidden: Millis, max_lost: Millis },
    #[error("{0} must be positive")]
    Zero(&'static str),
}

/// Eviction timings and culling threshold for the streaming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CachePolicy {
    /// Minimum projected size, in pixels, for an element to count as visible.
    pub visibility_threshold: f32,
    /// A hidden resident tile is evicted once hidden for longer than this.
    pub max_hidden_time: Millis,
    /// Any non-visible tile is evicted once unseen for longer than this.
    pub max_lost_time: Millis,
    /// Debounce after a camera-rest signal before recomputing visibility.
    pub rest_delay_ms: Millis,
    /// Period of the driver's sweep timer.
    pub sweep_interval_ms: Millis,
    /// Run a sweep at the end of every visibility update.
    pub sweep_on_update: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            visibility_threshold: 1.0,
            max_hidden_time: 100,
            max_lost_time: 40_000,
            rest_delay_ms: 200,
            sweep_interval_ms: 1000,
            sweep_on_update: true,
        }
    }
}

impl CachePolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.visibility_threshold.is_finite() || self.visibility_threshold < 0.0 {
            return Err(ConfigError::Threshold(self.visibility_threshold));
        }
        if self.max_hidden_time > self.max_lost_time {
            return Err(ConfigError::HiddenExceedsLost {
                max_hidden: self.max_hidden_time,
                max_lost: self.max_lost_time,
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Zero("sweepIntervalMs"));
        }
        Ok(())
    }

    pub fn rest_delay(&self) -> Duration {
        Duration::from_millis(self.rest_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
