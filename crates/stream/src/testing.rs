//! Fixtures shared by the unit tests of this crate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use glam::Vec3;
use tokio::sync::Semaphore;

use bimtiles_common::{BoundingBox, ChunkNaming, ElementId, Geometry, TileBuffer, TileId};
use bimtiles_index::{AssetRecord, GeometryEntry, GeometryManifest, TileIndex};

use crate::fetch::{FetchBackend, FetchFuture, MemoryFetcher};

pub(crate) const MODEL: &str = "fixture.ifc";

pub(crate) fn triangle_at(x: f32) -> Geometry {
    Geometry {
        positions: vec![[x, 0.0, 0.0], [x + 1.0, 0.0, 0.0], [x, 1.0, 0.0]],
        normals: Vec::new(),
        indices: vec![0, 1, 2],
    }
}

/// Build tiles holding `sizes[i]` elements each. Element ids start at 1 and
/// element `n` sits at `x = n`.
pub(crate) fn fixture(sizes: &[usize]) -> (Arc<TileIndex>, MemoryFetcher) {
    let naming = ChunkNaming::new(MODEL);
    let fetcher = MemoryFetcher::new();
    let mut geometries = BTreeMap::new();
    let mut assets = Vec::new();
    let mut tiles = Vec::new();
    let mut next = 1u32;
    let mut tile = TileId::FIRST;
    for &size in sizes {
        let mut buffer = TileBuffer::new();
        for _ in 0..size {
            let id = ElementId(next);
            let geometry = triangle_at(next as f32);
            let (offset, length) = buffer.append(id, &geometry);
            geometries.insert(
                id,
                GeometryEntry {
                    tile_id: tile,
                    geometry_file: naming.geometry_tile(tile),
                    bounding_box: BoundingBox::new(
                        Vec3::new(next as f32, 0.0, 0.0),
                        Vec3::new(next as f32 + 1.0, 1.0, 0.0),
                    ),
                    offset,
                    length,
                },
            );
            assets.push(AssetRecord {
                id,
                type_name: "IfcWall".into(),
                color: None,
            });
            next += 1;
        }
        let (_, bytes) = buffer.seal().unwrap();
        fetcher.insert(naming.geometry_tile(tile), bytes);
        tiles.push(tile);
        tile = tile.next();
    }
    let manifest = GeometryManifest {
        geometries: geometries.into(),
        assets,
        types: BTreeMap::from([("IfcWall".to_string(), tiles)]).into(),
        global_data_file_id: naming.global(),
    };
    let index = TileIndex::from_manifests(&manifest, None).unwrap();
    (Arc::new(index), fetcher)
}

/// Counts fetches before delegating to memory.
pub(crate) struct CountingFetcher {
    pub inner: MemoryFetcher,
    pub count: AtomicUsize,
}

impl CountingFetcher {
    pub fn new(inner: MemoryFetcher) -> Self {
        Self {
            inner,
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl FetchBackend for CountingFetcher {
    fn fetch<'a>(&'a self, name: &'a str) -> FetchFuture<'a> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(name)
    }
}

/// Holds every fetch until a permit is released.
pub(crate) struct GatedFetcher {
    pub inner: MemoryFetcher,
    pub gate: Semaphore,
}

impl GatedFetcher {
    pub fn new(inner: MemoryFetcher) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
        }
    }

    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }
}

impl FetchBackend for GatedFetcher {
    fn fetch<'a>(&'a self, name: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.fetch(name).await
        })
    }
}
