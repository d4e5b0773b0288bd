//! Tile Index: manifest wire types and the validated lookup built from them.
//!
//! # Invariants
//! - Every element id resolves to exactly one tile; violations fail construction.
//! - Tile and batch ids are dense and start at 1.
//! - Lookups of absent ids are errors, never defaults.

pub mod global;
mod index;
pub mod integrity;
pub mod manifest;

pub use global::{GlobalData, GlobalDataError};
pub use index::{ElementLocation, IndexError, TileIndex};
pub use integrity::{IntegrityEntry, IntegrityError, IntegrityManifest, sha256_hex};
pub use manifest::{AssetRecord, Entries, GeometryEntry, GeometryManifest, PropertiesManifest};
