mod config;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::{UVec2, Vec3};
use tracing_subscriber::EnvFilter;

use bimtiles_common::{BoundingBox, ChunkNaming, JsonLinesDecoder, ModelDecoder, count_json_lines};
use bimtiles_convert::{ConversionEvent, DirectorySink, TileWriter};
use bimtiles_index::{GlobalData, IntegrityManifest, TileIndex};
use bimtiles_stream::{
    CameraState, DirectoryFetcher, ScreenCoverageCuller, StreamDriver, StreamEvent,
    StreamingCache, VisibilityOracle,
};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "bimtiles", about = "Tile BIM models and stream them by visibility")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a JSON-lines element dump into tiles and manifests
    Convert {
        /// Element dump, one JSON element per line
        input: PathBuf,
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
        /// Model name used for chunk names (defaults to the input file stem)
        #[arg(short, long)]
        model: Option<String>,
        /// Override tiling.minGeometrySize
        #[arg(long)]
        min_geometry_size: Option<usize>,
        /// Override tiling.minAssetsSize
        #[arg(long)]
        min_assets_size: Option<usize>,
        /// Skip property batches
        #[arg(long)]
        no_properties: bool,
    },
    /// Print a summary of a converted model
    Inspect {
        dir: PathBuf,
        #[arg(short, long)]
        model: String,
    },
    /// Check every chunk against the integrity sidecar and the manifests
    Verify {
        dir: PathBuf,
        #[arg(short, long)]
        model: String,
    },
    /// Orbit a camera around a converted model and report cache behaviour
    Simulate {
        dir: PathBuf,
        #[arg(short, long)]
        model: String,
        /// Camera stops along the orbit
        #[arg(short, long, default_value = "36")]
        steps: u64,
        /// Simulated time between stops, in ms
        #[arg(long, default_value = "500")]
        step_ms: u64,
        /// Run the async driver on the wall clock instead of stepping the cache
        #[arg(long)]
        live: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Convert {
            input,
            out,
            model,
            min_geometry_size,
            min_assets_size,
            no_properties,
        } => {
            if let Some(size) = min_geometry_size {
                settings.tiling.min_geometry_size = size;
            }
            if let Some(size) = min_assets_size {
                settings.tiling.min_assets_size = size;
            }
            if no_properties {
                settings.tiling.properties = false;
            }
            settings.validate()?;
            let model = match model {
                Some(model) => model,
                None => model_name(&input)?,
            };
            run_convert(&settings, &input, &out, &model).await?;
        }
        Commands::Inspect { dir, model } => inspect(&dir, &model)?,
        Commands::Verify { dir, model } => verify(&dir, &model)?,
        Commands::Simulate {
            dir,
            model,
            steps,
            step_ms,
            live,
        } => {
            settings.validate()?;
            if live {
                simulate_live(&settings, &dir, &model, steps, step_ms).await?;
            } else {
                simulate(&settings, &dir, &model, steps, step_ms).await?;
            }
        }
    }

    Ok(())
}

/// `model.ifc.jsonl` becomes `model.ifc`.
fn model_name(input: &Path) -> anyhow::Result<String> {
    input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .with_context(|| format!("cannot derive a model name from {}", input.display()))
}

async fn run_convert(settings: &Settings, input: &Path, out: &Path, model: &str) -> anyhow::Result<()> {
    let raw = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let sink = DirectorySink::new(out)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ConversionEvent::TileSealed { id, bytes, elements, .. } => {
                    tracing::debug!(tile = %id, bytes, elements = elements.len(), "tile sealed");
                }
                ConversionEvent::BatchSealed { id, elements, .. } => {
                    tracing::debug!(batch = %id, elements, "batch sealed");
                }
                ConversionEvent::Progress(fraction) => {
                    tracing::info!(percent = (fraction * 100.0).round(), "progress");
                }
                ConversionEvent::Finished { geometry_manifest, .. } => {
                    tracing::info!(manifest = %geometry_manifest, "finished");
                }
            }
        }
    });

    let mut writer = TileWriter::new(
        settings.tiling.clone(),
        ChunkNaming::new(model),
        Arc::new(sink),
        Some(tx),
    )?;
    writer.set_expected_elements(count_json_lines(&raw));
    let output = writer.write_all(JsonLinesDecoder.decode(&raw)).await?;
    // The writer owned the only sender, so the reporter ends here.
    reporter.await?;

    println!(
        "converted {model}: {} elements, {} tiles, {} property batches (run {})",
        output.global.element_count,
        output.tiles.len(),
        output.batches.len(),
        output.run_id
    );
    Ok(())
}

fn inspect(dir: &Path, model: &str) -> anyhow::Result<()> {
    let naming = ChunkNaming::new(model);
    let index = TileIndex::load(dir, &naming)?;
    let global = GlobalData::decode(&std::fs::read(dir.join(index.global_data_file()))?)?;

    println!("model:     {}", global.model);
    println!("run:       {}", global.run_id);
    println!("elements:  {}", index.element_count());
    println!("tiles:     {}", index.tile_count());
    println!("properties: {}", if index.has_properties() { "yes" } else { "no" });
    if let Some(bounds) = global.bounds {
        println!("bounds:    {:?} .. {:?}", bounds.min, bounds.max);
    }
    println!("containers: {}", global.spatial_structure.len());
    let mut types: Vec<&str> = index.type_names().collect();
    types.sort_unstable();
    for type_name in types {
        let tiles = index.tiles_of_type(type_name)?;
        let count = global.type_counts.get(type_name).copied().unwrap_or(0);
        println!("  {type_name:<32} {count:>8} elements in {:>4} tiles", tiles.len());
    }
    Ok(())
}

fn verify(dir: &Path, model: &str) -> anyhow::Result<()> {
    let naming = ChunkNaming::new(model);
    let sidecar_path = dir.join(naming.integrity());
    let sidecar: IntegrityManifest = serde_json::from_slice(
        &std::fs::read(&sidecar_path).with_context(|| format!("reading {}", sidecar_path.display()))?,
    )?;
    sidecar.verify(|name| std::fs::read(dir.join(name)))?;

    let index = TileIndex::load(dir, &naming)?;
    for tile in index.tile_ids() {
        let file = index.geometry_file(tile)?;
        anyhow::ensure!(
            sidecar.get(file).is_some(),
            "tile {tile} ({file}) is not covered by the integrity sidecar"
        );
    }
    println!(
        "{model}: {} chunks verified, {} tiles indexed",
        sidecar.entries.len(),
        index.tile_count()
    );
    Ok(())
}

fn model_bounds(index: &TileIndex) -> anyhow::Result<BoundingBox> {
    index
        .bounds()
        .map(|(_, bounds)| bounds)
        .reduce(|a, b| a.union(&b))
        .context("model has no elements")
}

/// Camera on a circle around the model, looking at its center.
fn orbit_camera(bounds: &BoundingBox, step: u64, steps: u64) -> CameraState {
    let center = bounds.center();
    let radius = bounds.size().length().max(1.0);
    let angle = step as f32 / steps.max(1) as f32 * std::f32::consts::TAU;
    let eye = center + Vec3::new(angle.cos() * radius, radius * 0.5, angle.sin() * radius);
    CameraState::look_at(
        eye,
        center,
        60f32.to_radians(),
        UVec2::new(1280, 720),
        0.1,
        radius * 10.0,
    )
}

#[derive(Default)]
struct Tally {
    loaded: usize,
    evicted: usize,
    failed: usize,
}

impl Tally {
    fn record(&mut self, events: &[StreamEvent]) {
        for event in events {
            match event {
                StreamEvent::TileLoaded { .. } => self.loaded += 1,
                StreamEvent::TileEvicted(_) => self.evicted += 1,
                StreamEvent::FetchFailed { tile, error } => {
                    tracing::warn!(%tile, %error, "fetch failed");
                    self.failed += 1;
                }
                StreamEvent::TileHidden(_) | StreamEvent::TileShown(_) => {}
            }
        }
    }
}

fn open_cache(settings: &Settings, dir: &Path, model: &str) -> anyhow::Result<StreamingCache> {
    let index = Arc::new(TileIndex::load(dir, &ChunkNaming::new(model))?);
    Ok(StreamingCache::new(
        index,
        Arc::new(DirectoryFetcher::new(dir)),
        settings.streaming.clone(),
    )?)
}

async fn simulate(
    settings: &Settings,
    dir: &Path,
    model: &str,
    steps: u64,
    step_ms: u64,
) -> anyhow::Result<()> {
    let mut cache = open_cache(settings, dir, model)?;
    let index = Arc::clone(cache.index());
    let bounds = model_bounds(&index)?;
    let culler = ScreenCoverageCuller::new(settings.streaming.visibility_threshold);
    let mut tally = Tally::default();

    for step in 0..steps {
        let now = step * step_ms;
        let camera = orbit_camera(&bounds, step, steps);
        let visible: HashSet<_> = culler.query(&camera, &index);
        let mut events = cache.on_visibility_update(&visible, now)?;
        events.extend(cache.settle().await);
        events.extend(cache.sweep(now));
        tally.record(&events);

        let stats = cache.stats();
        tracing::info!(
            step,
            now,
            visible = visible.len(),
            resident = stats.resident,
            evictions = stats.evictions,
            "camera stop"
        );
    }

    let stats = cache.stats();
    println!(
        "{steps} stops: {} loads, {} evictions, {} failures, {} resident at end, {} fetches",
        tally.loaded, tally.evicted, tally.failed, stats.resident, stats.fetches_started
    );
    Ok(())
}

async fn simulate_live(
    settings: &Settings,
    dir: &Path,
    model: &str,
    steps: u64,
    step_ms: u64,
) -> anyhow::Result<()> {
    let cache = open_cache(settings, dir, model)?;
    let bounds = model_bounds(cache.index())?;
    let culler = Arc::new(ScreenCoverageCuller::new(settings.streaming.visibility_threshold));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = StreamDriver::new(cache, culler, tx).spawn();

    let mut tally = Tally::default();
    for step in 0..steps {
        handle.camera_rest(orbit_camera(&bounds, step, steps));
        tokio::time::sleep(Duration::from_millis(step_ms)).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        tally.record(&events);
    }

    let cache = handle.shutdown().await?;
    println!(
        "{steps} stops (live): {} loads, {} evictions, {} failures, {} resident at end",
        tally.loaded,
        tally.evicted,
        tally.failed,
        cache.stats().resident
    );
    Ok(())
}
