//! Streaming side: decides which geometry tiles are resident from what the
//! camera currently shows.
//!
//! # Invariants
//! - A visible tile is never evicted.
//! - At most one fetch is in flight per tile record.
//! - A completion that arrives after its record was evicted is dropped.

mod cache;
mod culler;
mod driver;
mod fetch;
mod policy;
#[cfg(test)]
mod testing;

pub use cache::{CacheStats, Completion, StreamError, StreamEvent, StreamingCache, TileState};
pub use culler::{CameraState, Frustum, ScreenCoverageCuller, VisibilityOracle, projected_extent};
pub use driver::{StreamDriver, StreamHandle};
pub use fetch::{DirectoryFetcher, FetchBackend, FetchError, FetchFuture, MemoryFetcher};
pub use policy::{CachePolicy, ConfigError, Millis};
