//! Streaming partitioner: elements in, sealed chunks and manifests out.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use bimtiles_common::{
    BatchId, CONTAINED_IN_STRUCTURE, ChunkNaming, DecodeError, Element, ElementId,
    TileBuffer, TileId,
};
use bimtiles_index::{
    AssetRecord, GeometryEntry, GeometryManifest, GlobalData, IntegrityManifest,
    PropertiesManifest, TileIndex, sha256_hex,
};

use crate::config::TilingConfig;
use crate::error::ConvertError;
use crate::persister::{Persister, RetryPolicy, put_with_retry};
use crate::sink::{ChunkSink, SinkError};

/// Notifications emitted while a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionEvent {
    TileSealed {
        id: TileId,
        name: String,
        elements: Vec<ElementId>,
        bytes: usize,
        sha256: String,
    },
    BatchSealed {
        id: BatchId,
        name: String,
        elements: usize,
        sha256: String,
    },
    /// Fraction of expected elements processed, in `[0, 1]`.
    Progress(f32),
    Finished {
        geometry_manifest: String,
        properties_manifest: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SealedTile {
    pub id: TileId,
    pub name: String,
    pub elements: Vec<ElementId>,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SealedBatch {
    pub id: BatchId,
    pub name: String,
    pub elements: usize,
    pub sha256: String,
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub run_id: Uuid,
    pub geometry_manifest: GeometryManifest,
    pub properties_manifest: Option<PropertiesManifest>,
    pub global: GlobalData,
    pub tiles: Vec<SealedTile>,
    pub batches: Vec<SealedBatch>,
    pub integrity: IntegrityManifest,
}

/// One conversion run.
///
/// Elements are pushed in decode order. Tile and batch ids are assigned in
/// seal order, so the id of the open tile is always `next_tile`.
pub struct TileWriter {
    config: TilingConfig,
    naming: ChunkNaming,
    run_id: Uuid,
    sink: Arc<dyn ChunkSink>,
    persister: Persister,
    events: Option<UnboundedSender<ConversionEvent>>,

    seen: HashSet<ElementId>,
    processed: usize,
    expected: Option<usize>,
    last_percent: u32,

    open_tile: TileBuffer,
    open_tile_types: BTreeSet<String>,
    next_tile: TileId,
    geometries: BTreeMap<ElementId, GeometryEntry>,
    assets: Vec<AssetRecord>,
    tile_types: BTreeMap<String, Vec<TileId>>,
    tiles: Vec<SealedTile>,

    open_batch: BTreeMap<ElementId, BTreeMap<String, Value>>,
    open_batch_types: BTreeSet<String>,
    next_batch: BatchId,
    batch_ids: BTreeMap<ElementId, BatchId>,
    batch_types: BTreeMap<String, Vec<BatchId>>,
    relations: BTreeMap<ElementId, BTreeMap<String, Vec<ElementId>>>,
    batches: Vec<SealedBatch>,

    global: GlobalData,
    integrity: IntegrityManifest,
}

impl TileWriter {
    /// Start a run. Must be called from within a Tokio runtime.
    pub fn new(
        config: TilingConfig,
        naming: ChunkNaming,
        sink: Arc<dyn ChunkSink>,
        events: Option<UnboundedSender<ConversionEvent>>,
    ) -> Result<Self, ConvertError> {
        config.validate()?;
        let run_id = Uuid::new_v4();
        let persister = Persister::spawn(sink.clone(), retry_policy(&config));
        tracing::info!(model = naming.model(), %run_id, "conversion started");
        Ok(Self {
            global: GlobalData::new(naming.model(), run_id),
            config,
            naming,
            run_id,
            sink,
            persister,
            events,
            seen: HashSet::new(),
            processed: 0,
            expected: None,
            last_percent: 0,
            open_tile: TileBuffer::new(),
            open_tile_types: BTreeSet::new(),
            next_tile: TileId::FIRST,
            geometries: BTreeMap::new(),
            assets: Vec::new(),
            tile_types: BTreeMap::new(),
            tiles: Vec::new(),
            open_batch: BTreeMap::new(),
            open_batch_types: BTreeSet::new(),
            next_batch: BatchId::FIRST,
            batch_ids: BTreeMap::new(),
            batch_types: BTreeMap::new(),
            relations: BTreeMap::new(),
            batches: Vec::new(),
            integrity: IntegrityManifest::default(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Enable fractional progress reporting against `count` elements.
    pub fn set_expected_elements(&mut self, count: usize) {
        self.expected = Some(count);
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Append one element, sealing the open tile or batch when full.
    pub fn push(&mut self, element: Element) -> Result<(), ConvertError> {
        element.validate()?;
        if !self.seen.insert(element.id) {
            return Err(DecodeError::DuplicateElement(element.id).into());
        }

        let id = element.id;
        let bounds = element.bounding_volume();
        let (offset, length) = self.open_tile.append(id, &element.geometry);
        self.geometries.insert(
            id,
            GeometryEntry {
                tile_id: self.next_tile,
                geometry_file: self.naming.geometry_tile(self.next_tile),
                bounding_box: bounds,
                offset,
                length,
            },
        );
        self.assets.push(AssetRecord {
            id,
            type_name: element.type_name.clone(),
            color: element.color,
        });
        self.open_tile_types.insert(element.type_name.clone());
        self.record_global(&element);

        if self.config.properties {
            self.batch_ids.insert(id, self.next_batch);
            self.open_batch_types.insert(element.type_name);
            if !element.relations.is_empty() {
                self.relations.insert(id, element.relations);
            }
            self.open_batch.insert(id, element.properties);
        }

        if self.open_tile.byte_len() >= self.config.min_geometry_size {
            self.seal_tile()?;
        }
        if self.config.properties && self.open_batch.len() >= self.config.min_assets_size {
            self.seal_batch()?;
        }

        self.processed += 1;
        self.report_progress();
        Ok(())
    }

    /// Seal what is left, persist every chunk, then write the manifests.
    pub async fn finish(mut self) -> Result<ConversionOutput, ConvertError> {
        let queued = self.queue_remaining();
        // A failed persister reports the root cause, so it is checked first.
        let written = self.persister.finish().await?;
        let (global_name, indexes_name) = queued?;
        tracing::debug!(run_id = %self.run_id, written, "all chunks persisted");

        let geometry_manifest = GeometryManifest {
            geometries: std::mem::take(&mut self.geometries).into(),
            assets: std::mem::take(&mut self.assets),
            types: std::mem::take(&mut self.tile_types).into(),
            global_data_file_id: global_name,
        };
        let properties_manifest = self.config.properties.then(|| PropertiesManifest {
            types: std::mem::take(&mut self.batch_types).into(),
            ids: std::mem::take(&mut self.batch_ids).into(),
            indexes_file: indexes_name,
        });
        TileIndex::from_manifests(&geometry_manifest, properties_manifest.as_ref())?;

        let policy = retry_policy(&self.config);
        let geometry_name = self.naming.geometry_manifest();
        let bytes = serde_json::to_vec(&geometry_manifest)?;
        put_with_retry(self.sink.as_ref(), &geometry_name, &bytes, policy).await?;
        self.integrity.push(geometry_name.clone(), sha256_hex(&bytes));

        let properties_name = match &properties_manifest {
            Some(manifest) => {
                let name = self.naming.properties_manifest();
                let bytes = serde_json::to_vec(manifest)?;
                put_with_retry(self.sink.as_ref(), &name, &bytes, policy).await?;
                self.integrity.push(name.clone(), sha256_hex(&bytes));
                Some(name)
            }
            None => None,
        };

        let sidecar = serde_json::to_vec_pretty(&self.integrity)?;
        put_with_retry(self.sink.as_ref(), &self.naming.integrity(), &sidecar, policy).await?;

        tracing::info!(
            run_id = %self.run_id,
            elements = self.processed,
            tiles = self.tiles.len(),
            batches = self.batches.len(),
            "conversion finished"
        );
        emit(&self.events, ConversionEvent::Progress(1.0));
        emit(&self.events, ConversionEvent::Finished {
            geometry_manifest: geometry_name,
            properties_manifest: properties_name,
        });

        Ok(ConversionOutput {
            run_id: self.run_id,
            geometry_manifest,
            properties_manifest,
            global: self.global,
            tiles: self.tiles,
            batches: self.batches,
            integrity: self.integrity,
        })
    }

    /// Seal the open tile and batch, then queue the global and indexes chunks.
    fn queue_remaining(&mut self) -> Result<(String, String), ConvertError> {
        if !self.open_tile.is_empty() {
            self.seal_tile()?;
        }
        if !self.open_batch.is_empty() {
            self.seal_batch()?;
        }

        let global_name = self.naming.global();
        let global = self.global.encode()?;
        self.integrity.push(global_name.clone(), sha256_hex(&global));
        self.submit(global_name.clone(), global)?;

        let indexes_name = self.naming.properties_indexes();
        if self.config.properties {
            let indexes = serde_json::to_vec(&self.relations)?;
            self.integrity.push(indexes_name.clone(), sha256_hex(&indexes));
            self.submit(indexes_name.clone(), indexes)?;
        }
        Ok((global_name, indexes_name))
    }

    fn record_global(&mut self, element: &Element) {
        self.global.element_count += 1;
        *self
            .global
            .type_counts
            .entry(element.type_name.clone())
            .or_default() += 1;
        if let Some(bounds) = element.spatial_bounds() {
            self.global.bounds = Some(match self.global.bounds {
                Some(total) => total.union(&bounds),
                None => bounds,
            });
        }
        if let Some(containers) = element.relations.get(CONTAINED_IN_STRUCTURE) {
            for container in containers {
                self.global
                    .spatial_structure
                    .entry(*container)
                    .or_default()
                    .push(element.id);
            }
        }
    }

    fn seal_tile(&mut self) -> Result<(), ConvertError> {
        let id = self.next_tile;
        let (elements, data) = self.open_tile.seal()?;
        let name = self.naming.geometry_tile(id);
        let sha256 = sha256_hex(&data);
        for type_name in std::mem::take(&mut self.open_tile_types) {
            self.tile_types.entry(type_name).or_default().push(id);
        }
        tracing::debug!(tile = %id, elements = elements.len(), bytes = data.len(), "tile sealed");

        let tile = SealedTile {
            id,
            name: name.clone(),
            elements,
            bytes: data.len(),
            sha256: sha256.clone(),
        };
        self.integrity.push(name.clone(), sha256);
        self.submit(name, data)?;
        emit(&self.events, ConversionEvent::TileSealed {
            id,
            name: tile.name.clone(),
            elements: tile.elements.clone(),
            bytes: tile.bytes,
            sha256: tile.sha256.clone(),
        });
        self.tiles.push(tile);
        self.next_tile = id.next();
        Ok(())
    }

    fn seal_batch(&mut self) -> Result<(), ConvertError> {
        let id = self.next_batch;
        let batch = std::mem::take(&mut self.open_batch);
        let data = serde_json::to_vec(&batch)?;
        let name = self.naming.property_batch(id);
        let sha256 = sha256_hex(&data);
        for type_name in std::mem::take(&mut self.open_batch_types) {
            self.batch_types.entry(type_name).or_default().push(id);
        }
        tracing::debug!(batch = %id, elements = batch.len(), "property batch sealed");

        self.integrity.push(name.clone(), sha256.clone());
        self.submit(name.clone(), data)?;
        emit(&self.events, ConversionEvent::BatchSealed {
            id,
            name: name.clone(),
            elements: batch.len(),
            sha256: sha256.clone(),
        });
        self.batches.push(SealedBatch {
            id,
            name,
            elements: batch.len(),
            sha256,
        });
        self.next_batch = id.next();
        Ok(())
    }

    fn submit(&self, name: String, data: Vec<u8>) -> Result<(), ConvertError> {
        tracing::trace!(chunk = %name, bytes = data.len(), "chunk queued");
        self.persister.submit(name, data)
    }

    /// Push every decoded element, then finish the run.
    ///
    /// Aborts on the first decode or push error. When the persister has
    /// stopped, the error it stopped on is returned instead of the closed queue.
    pub async fn write_all<I>(mut self, elements: I) -> Result<ConversionOutput, ConvertError>
    where
        I: IntoIterator<Item = Result<Element, DecodeError>>,
    {
        for element in elements {
            if let Err(err) = self.push(element?) {
                if matches!(err, ConvertError::Sink(SinkError::Closed)) {
                    return self.finish().await;
                }
                return Err(err);
            }
        }
        self.finish().await
    }

    fn report_progress(&mut self) {
        let Some(total) = self.expected.filter(|t| *t > 0) else {
            return;
        };
        // 1.0 is reserved for the end of `finish`.
        let fraction = (self.processed as f32 / total as f32).min(0.99);
        let percent = (fraction * 100.0) as u32;
        if percent > self.last_percent {
            self.last_percent = percent;
            emit(&self.events, ConversionEvent::Progress(fraction));
        }
    }
}

fn emit(events: &Option<UnboundedSender<ConversionEvent>>, event: ConversionEvent) {
    if let Some(events) = events {
        // A dropped receiver only means nobody is listening.
        let _ = events.send(event);
    }
}

fn retry_policy(config: &TilingConfig) -> RetryPolicy {
    RetryPolicy {
        retries: config.seal_retries,
        backoff: config.retry_backoff(),
    }
}

/// Run a writer over decoded elements, aborting on the first error.
///
/// When the iterator knows its exact length it is used for progress.
pub async fn convert<I>(
    config: TilingConfig,
    naming: ChunkNaming,
    sink: Arc<dyn ChunkSink>,
    elements: I,
    events: Option<UnboundedSender<ConversionEvent>>,
) -> Result<ConversionOutput, ConvertError>
where
    I: IntoIterator<Item = Result<Element, DecodeError>>,
{
    let elements = elements.into_iter();
    let mut writer = TileWriter::new(config, naming, sink, events)?;
    if let (lower, Some(upper)) = elements.size_hint() {
        if lower == upper {
            writer.set_expected_elements(upper);
        }
    }
    writer.write_all(elements).await
}
