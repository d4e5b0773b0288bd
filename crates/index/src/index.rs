use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use bimtiles_common::{BatchId, BoundingBox, ChunkNaming, ElementId, TileId};

use crate::manifest::{GeometryManifest, PropertiesManifest};

/// Errors from building or querying the tile index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index inconsistency: {0}")]
    Inconsistency(String),
    #[error("element {0} is not in the index")]
    UnknownElement(ElementId),
    #[error("type {0:?} is not in the index")]
    UnknownType(String),
    #[error("tile {0} is not in the index")]
    UnknownTile(TileId),
    #[error("model was converted without properties")]
    NoProperties,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of one element's geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementLocation {
    pub tile: TileId,
    pub bounds: BoundingBox,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
struct TileInfo {
    file: String,
    elements: Vec<ElementId>,
}

#[derive(Debug, Clone)]
struct PropertyLookup {
    ids: HashMap<ElementId, BatchId>,
    types: HashMap<String, Vec<BatchId>>,
    indexes_file: String,
}

/// Read-mostly lookup from elements and types to tiles and property batches.
///
/// Built once from the manifests and never mutated. Every element id
/// resolves to exactly one tile (and at most one batch); any manifest that
/// breaks this is rejected at construction.
#[derive(Debug, Clone)]
pub struct TileIndex {
    elements: HashMap<ElementId, ElementLocation>,
    element_types: HashMap<ElementId, String>,
    tiles: BTreeMap<TileId, TileInfo>,
    types: HashMap<String, Vec<TileId>>,
    global_data_file: String,
    properties: Option<PropertyLookup>,
}

impl TileIndex {
    /// Validate the manifests and build the lookup tables.
    pub fn from_manifests(
        geometry: &GeometryManifest,
        properties: Option<&PropertiesManifest>,
    ) -> Result<Self, IndexError> {
        let mut elements = HashMap::with_capacity(geometry.geometries.len());
        let mut tiles: BTreeMap<TileId, TileInfo> = BTreeMap::new();

        for (id, entry) in geometry.geometries.iter() {
            let location = ElementLocation {
                tile: entry.tile_id,
                bounds: entry.bounding_box,
                offset: entry.offset,
                length: entry.length,
            };
            if elements.insert(*id, location).is_some() {
                return Err(inconsistent(format!("element {id} has more than one geometry entry")));
            }
            let info = tiles.entry(entry.tile_id).or_insert_with(|| TileInfo {
                file: entry.geometry_file.clone(),
                elements: Vec::new(),
            });
            if info.file != entry.geometry_file {
                return Err(inconsistent(format!(
                    "{} is stored in both {:?} and {:?}",
                    entry.tile_id, info.file, entry.geometry_file
                )));
            }
            info.elements.push(*id);
        }

        check_dense(tiles.keys().map(|t| t.0), "tile")?;
        let mut files = HashSet::new();
        for (tile, info) in &tiles {
            if !files.insert(info.file.as_str()) {
                return Err(inconsistent(format!("{tile} shares file {:?}", info.file)));
            }
        }

        let mut types = HashMap::with_capacity(geometry.types.len());
        for (type_name, list) in geometry.types.iter() {
            if let Some(unknown) = list.iter().find(|t| !tiles.contains_key(*t)) {
                return Err(inconsistent(format!("type {type_name:?} lists unknown {unknown}")));
            }
            if list.iter().collect::<BTreeSet<_>>().len() != list.len() {
                return Err(inconsistent(format!("type {type_name:?} lists a tile twice")));
            }
            if types.insert(type_name.clone(), list.clone()).is_some() {
                return Err(inconsistent(format!("type {type_name:?} listed twice")));
            }
        }

        let mut element_types = HashMap::with_capacity(geometry.assets.len());
        for asset in &geometry.assets {
            let location = elements.get(&asset.id).ok_or_else(|| {
                inconsistent(format!("asset {} has no geometry entry", asset.id))
            })?;
            let listed = types
                .get(&asset.type_name)
                .is_some_and(|list| list.contains(&location.tile));
            if !listed {
                return Err(inconsistent(format!(
                    "type {:?} does not list {} holding asset {}",
                    asset.type_name, location.tile, asset.id
                )));
            }
            if element_types.insert(asset.id, asset.type_name.clone()).is_some() {
                return Err(inconsistent(format!("asset {} listed twice", asset.id)));
            }
        }

        let properties = properties
            .map(|manifest| build_property_lookup(manifest, &elements))
            .transpose()?;

        tracing::debug!(
            elements = elements.len(),
            tiles = tiles.len(),
            types = types.len(),
            properties = properties.is_some(),
            "tile index built"
        );

        Ok(Self {
            elements,
            element_types,
            tiles,
            types,
            global_data_file: geometry.global_data_file_id.clone(),
            properties,
        })
    }

    /// Parse and validate manifest documents.
    pub fn from_json(geometry: &[u8], properties: Option<&[u8]>) -> Result<Self, IndexError> {
        let geometry: GeometryManifest = serde_json::from_slice(geometry)?;
        let properties: Option<PropertiesManifest> =
            properties.map(serde_json::from_slice).transpose()?;
        Self::from_manifests(&geometry, properties.as_ref())
    }

    /// Load the manifests of `naming`'s model from a directory.
    ///
    /// The properties manifest is optional; the geometry manifest is not.
    pub fn load(dir: impl AsRef<Path>, naming: &ChunkNaming) -> Result<Self, IndexError> {
        let dir = dir.as_ref();
        let geometry = std::fs::read(dir.join(naming.geometry_manifest()))?;
        let properties = match std::fs::read(dir.join(naming.properties_manifest())) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&geometry, properties.as_deref())
    }

    /// Tile holding the element's geometry.
    pub fn tile_for(&self, id: ElementId) -> Result<TileId, IndexError> {
        self.location(id).map(|l| l.tile)
    }

    /// Property batch holding the element's properties.
    pub fn batch_for(&self, id: ElementId) -> Result<BatchId, IndexError> {
        let props = self.properties.as_ref().ok_or(IndexError::NoProperties)?;
        props
            .ids
            .get(&id)
            .copied()
            .ok_or(IndexError::UnknownElement(id))
    }

    pub fn tiles_of_type(&self, type_name: &str) -> Result<&[TileId], IndexError> {
        self.types
            .get(type_name)
            .map(Vec::as_slice)
            .ok_or_else(|| IndexError::UnknownType(type_name.to_string()))
    }

    pub fn batches_of_type(&self, type_name: &str) -> Result<&[BatchId], IndexError> {
        let props = self.properties.as_ref().ok_or(IndexError::NoProperties)?;
        props
            .types
            .get(type_name)
            .map(Vec::as_slice)
            .ok_or_else(|| IndexError::UnknownType(type_name.to_string()))
    }

    pub fn bounding_volume(&self, id: ElementId) -> Result<BoundingBox, IndexError> {
        self.location(id).map(|l| l.bounds)
    }

    pub fn location(&self, id: ElementId) -> Result<&ElementLocation, IndexError> {
        self.elements.get(&id).ok_or(IndexError::UnknownElement(id))
    }

    pub fn type_of(&self, id: ElementId) -> Option<&str> {
        self.element_types.get(&id).map(String::as_str)
    }

    pub fn geometry_file(&self, tile: TileId) -> Result<&str, IndexError> {
        self.tiles
            .get(&tile)
            .map(|t| t.file.as_str())
            .ok_or(IndexError::UnknownTile(tile))
    }

    pub fn elements_in_tile(&self, tile: TileId) -> Result<&[ElementId], IndexError> {
        self.tiles
            .get(&tile)
            .map(|t| t.elements.as_slice())
            .ok_or(IndexError::UnknownTile(tile))
    }

    /// Decompressed size of a tile's record stream, from its elements' lengths.
    pub fn tile_byte_len(&self, tile: TileId) -> Result<u64, IndexError> {
        let elements = self.elements_in_tile(tile)?;
        Ok(elements
            .iter()
            .filter_map(|id| self.elements.get(id))
            .map(|l| l.length)
            .sum())
    }

    pub fn element_ids(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.elements.keys().copied()
    }

    /// Iterate every element with its bounding volume, for culling.
    pub fn bounds(&self) -> impl Iterator<Item = (ElementId, BoundingBox)> + '_ {
        self.elements.iter().map(|(id, l)| (*id, l.bounds))
    }

    pub fn tile_ids(&self) -> impl Iterator<Item = TileId> + '_ {
        self.tiles.keys().copied()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.types.keys().map(String::as_str)
    }

    pub fn global_data_file(&self) -> &str {
        &self.global_data_file
    }

    pub fn indexes_file(&self) -> Option<&str> {
        self.properties.as_ref().map(|p| p.indexes_file.as_str())
    }

    pub fn has_properties(&self) -> bool {
        self.properties.is_some()
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }
}

/// Every geometry element must appear in exactly one batch, and nothing else may.
fn build_property_lookup(
    manifest: &PropertiesManifest,
    elements: &HashMap<ElementId, ElementLocation>,
) -> Result<PropertyLookup, IndexError> {
    let mut types: HashMap<String, Vec<BatchId>> = HashMap::with_capacity(manifest.types.len());
    let mut batches = BTreeSet::new();
    for (type_name, list) in manifest.types.iter() {
        if list.iter().collect::<BTreeSet<_>>().len() != list.len() {
            return Err(inconsistent(format!("type {type_name:?} lists a batch twice")));
        }
        batches.extend(list.iter().copied());
        if types.insert(type_name.clone(), list.clone()).is_some() {
            return Err(inconsistent(format!("property type {type_name:?} listed twice")));
        }
    }
    check_dense(batches.iter().map(|b| b.0), "batch")?;

    let mut ids = HashMap::with_capacity(manifest.ids.len());
    for (id, batch) in manifest.ids.iter() {
        if !batches.contains(batch) {
            return Err(inconsistent(format!("element {id} points at unlisted {batch}")));
        }
        if !elements.contains_key(id) {
            return Err(inconsistent(format!("element {id} has properties but no geometry")));
        }
        if ids.insert(*id, *batch).is_some() {
            return Err(inconsistent(format!("element {id} is in more than one batch")));
        }
    }

    if let Some(missing) = elements.keys().find(|id| !ids.contains_key(*id)) {
        return Err(inconsistent(format!("element {missing} has no property batch")));
    }

    Ok(PropertyLookup {
        ids,
        types,
        indexes_file: manifest.indexes_file.clone(),
    })
}

/// Ids must be exactly `1..=n` once sorted.
fn check_dense(ids: impl Iterator<Item = u32>, kind: &str) -> Result<(), IndexError> {
    for (expected, id) in (1u32..).zip(ids) {
        if id != expected {
            return Err(inconsistent(format!(
                "{kind} ids are not dense: expected {expected}, found {id}"
            )));
        }
    }
    Ok(())
}

fn inconsistent(message: String) -> IndexError {
    IndexError::Inconsistency(message)
}
