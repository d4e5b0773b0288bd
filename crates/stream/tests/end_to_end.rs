use std::collections::HashSet;
use std::sync::Arc;

use glam::{UVec2, Vec3};

use bimtiles_common::{ChunkNaming, Element, ElementId, Geometry, TileId};
use bimtiles_convert::{DirectorySink, MemorySink, TilingConfig, convert};
use bimtiles_index::TileIndex;
use bimtiles_stream::{
    CachePolicy, CameraState, DirectoryFetcher, MemoryFetcher, ScreenCoverageCuller,
    StreamDriver, StreamEvent, StreamingCache, TileState, VisibilityOracle,
};

const MODEL: &str = "small.ifc";

/// A row of unit quads along x; element `n` spans `x in [n, n + 1]`.
fn model(count: u32) -> Vec<Element> {
    (1..=count)
        .map(|n| {
            let x = n as f32;
            let geometry = Geometry {
                positions: vec![
                    [x, 0.0, 0.0],
                    [x + 1.0, 0.0, 0.0],
                    [x + 1.0, 1.0, 0.0],
                    [x, 1.0, 0.0],
                ],
                normals: vec![[0.0, 0.0, 1.0]; 4],
                indices: vec![0, 1, 2, 0, 2, 3],
            };
            let type_name = if n % 2 == 0 { "IfcWall" } else { "IfcSlab" };
            Element::new(ElementId(n), type_name, geometry)
                .with_property("Name", serde_json::Value::from(format!("Element {n}")))
        })
        .collect()
}

fn tiling(elements_per_tile: usize) -> TilingConfig {
    let size = model(1)[0].geometry.byte_len();
    TilingConfig {
        min_geometry_size: size * elements_per_tile,
        min_assets_size: 4,
        ..TilingConfig::default()
    }
}

fn camera_over(x_min: f32, x_max: f32) -> CameraState {
    let center = (x_min + x_max) * 0.5;
    CameraState::look_at(
        Vec3::new(center, 0.5, 4.0),
        Vec3::new(center, 0.5, 0.0),
        45f32.to_radians(),
        UVec2::new(1024, 768),
        0.1,
        500.0,
    )
}

#[tokio::test]
async fn convert_index_and_stream_in_memory() {
    let sink = MemorySink::new();
    let output = convert(
        tiling(5),
        ChunkNaming::new(MODEL),
        Arc::new(sink.clone()),
        model(40).into_iter().map(Ok),
        None,
    )
    .await
    .unwrap();
    assert_eq!(output.tiles.len(), 8);

    let naming = ChunkNaming::new(MODEL);
    let index = TileIndex::from_json(
        &sink.get(&naming.geometry_manifest()).unwrap(),
        sink.get(&naming.properties_manifest()).as_deref(),
    )
    .unwrap();
    assert_eq!(index.element_count(), 40);
    assert_eq!(index.tile_for(ElementId(12)).unwrap(), TileId(3));
    assert_eq!(index.tiles_of_type("IfcWall").unwrap().len(), 8);
    let index = Arc::new(index);

    let fetcher = MemoryFetcher::from_chunks(sink.snapshot());
    let mut cache =
        StreamingCache::new(Arc::clone(&index), Arc::new(fetcher), CachePolicy::default()).unwrap();
    let culler = ScreenCoverageCuller::new(1.0);

    let visible = culler.query(&camera_over(11.0, 14.0), &index);
    assert!(visible.contains(&ElementId(12)));
    assert!(!visible.contains(&ElementId(40)));
    cache.on_visibility_update(&visible, 0).unwrap();
    let events = cache.settle().await;

    let tiles: HashSet<TileId> = visible
        .iter()
        .map(|id| index.tile_for(*id).unwrap())
        .collect();
    let loaded: HashSet<TileId> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::TileLoaded { tile, .. } => Some(*tile),
            _ => None,
        })
        .collect();
    assert_eq!(loaded, tiles);

    let content = cache.content(TileId(3)).unwrap();
    let geometry = content.get(ElementId(12)).unwrap();
    assert_eq!(geometry.positions[0], [12.0, 0.0, 0.0]);
    assert_eq!(geometry.triangle_count(), 2);

    // Look away; the old tiles age out once hidden long enough.
    let elsewhere = culler.query(&camera_over(36.0, 39.0), &index);
    cache.on_visibility_update(&elsewhere, 1_000).unwrap();
    cache.settle().await;
    cache.sweep(1_000 + cache.policy().max_hidden_time + 1);
    assert_eq!(cache.state(TileId(3)), TileState::Unfetched);
    assert!(cache.resident_tiles().contains(&TileId(8)));
}

#[tokio::test]
async fn directory_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let sink = DirectorySink::new(dir.path()).unwrap();
    let output = convert(
        tiling(3),
        ChunkNaming::new(MODEL),
        Arc::new(sink),
        model(10).into_iter().map(Ok),
        None,
    )
    .await
    .unwrap();

    output
        .integrity
        .verify(|name| std::fs::read(dir.path().join(name)))
        .unwrap();

    let index = Arc::new(TileIndex::load(dir.path(), &ChunkNaming::new(MODEL)).unwrap());
    assert!(index.has_properties());
    assert_eq!(index.tile_count(), 4);

    let mut cache = StreamingCache::new(
        Arc::clone(&index),
        Arc::new(DirectoryFetcher::new(dir.path())),
        CachePolicy::default(),
    )
    .unwrap();
    let all: HashSet<ElementId> = index.element_ids().collect();
    cache.on_visibility_update(&all, 0).unwrap();
    cache.settle().await;
    assert_eq!(
        cache.resident_tiles(),
        vec![TileId(1), TileId(2), TileId(3), TileId(4)]
    );
}

#[tokio::test(start_paused = true)]
async fn driver_streams_after_camera_rest() {
    let sink = MemorySink::new();
    convert(
        tiling(5),
        ChunkNaming::new(MODEL),
        Arc::new(sink.clone()),
        model(20).into_iter().map(Ok),
        None,
    )
    .await
    .unwrap();
    let index = Arc::new(TileIndex::from_json(
        &sink.get(&ChunkNaming::new(MODEL).geometry_manifest()).unwrap(),
        None,
    )
    .unwrap());
    let cache = StreamingCache::new(
        index,
        Arc::new(MemoryFetcher::from_chunks(sink.snapshot())),
        CachePolicy::default(),
    )
    .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = StreamDriver::new(cache, Arc::new(ScreenCoverageCuller::new(1.0)), tx).spawn();
    handle.camera_rest(camera_over(1.0, 4.0));
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let mut loaded = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let StreamEvent::TileLoaded { tile, .. } = event {
            loaded.push(tile);
        }
    }
    assert!(loaded.contains(&TileId(1)));
    assert!(!loaded.contains(&TileId(4)));

    let cache = handle.shutdown().await.unwrap();
    assert_eq!(cache.state(TileId(1)), TileState::Resident { visible: true });
}
