use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use bimtiles_common::{ElementId, TileContent, TileId, decode_tile};
use bimtiles_index::{IndexError, TileIndex};

use crate::fetch::{FetchBackend, FetchError};
use crate::policy::{CachePolicy, ConfigError, Millis};

/// Caller errors. Fetch failures never surface here; they become events.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("index lookup failed: {0}")]
    Index(#[from] IndexError),
    #[error("invalid streaming configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("stream driver stopped unexpectedly")]
    Stopped,
}

/// Lifecycle of one tile as seen by the cache.
///
/// An evicted tile has no record and reports [`TileState::Unfetched`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Unfetched,
    Fetching,
    Resident { visible: bool },
}

/// Notifications for the scene consumer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TileLoaded {
        tile: TileId,
        content: Arc<TileContent>,
    },
    TileHidden(TileId),
    TileShown(TileId),
    TileEvicted(TileId),
    FetchFailed {
        tile: TileId,
        error: Arc<FetchError>,
    },
}

/// Snapshot of cache occupancy and counters since creation.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub resident: usize,
    pub fetching: usize,
    pub visible_tiles: usize,
    pub fetches_started: u64,
    pub fetches_failed: u64,
    pub completions_applied: u64,
    pub completions_discarded: u64,
    pub evictions: u64,
    pub update_time: Duration,
}

/// Result of a background fetch, tagged with the record generation that
/// requested it.
#[derive(Debug)]
pub struct Completion {
    tile: TileId,
    generation: u64,
    result: Result<TileContent, FetchError>,
}

impl Completion {
    pub fn tile(&self) -> TileId {
        self.tile
    }
}

#[derive(Debug)]
enum Phase {
    Fetching,
    Resident(Arc<TileContent>),
}

#[derive(Debug)]
struct TileRecord {
    generation: u64,
    phase: Phase,
    visible: bool,
    last_visible: Millis,
    hidden_since: Option<Millis>,
}

impl TileRecord {
    fn is_resident(&self) -> bool {
        matches!(self.phase, Phase::Resident(_))
    }

    fn is_fetching(&self) -> bool {
        matches!(self.phase, Phase::Fetching)
    }

    fn expired(&self, now: Millis, policy: &CachePolicy) -> bool {
        if self.visible {
            return false;
        }
        if now.saturating_sub(self.last_visible) > policy.max_lost_time {
            return true;
        }
        match (&self.phase, self.hidden_since) {
            (Phase::Resident(_), Some(since)) => now.saturating_sub(since) > policy.max_hidden_time,
            _ => false,
        }
    }
}

/// Tile residency driven by visibility updates.
///
/// Every state change goes through `&mut self`, so updates, sweeps and
/// completions never interleave. Fetches run as spawned tasks and report
/// back over a channel; a completion whose generation no longer matches the
/// live record is dropped.
pub struct StreamingCache {
    index: Arc<TileIndex>,
    backend: Arc<dyn FetchBackend>,
    policy: CachePolicy,
    records: HashMap<TileId, TileRecord>,
    next_generation: u64,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    stats: CacheStats,
}

impl StreamingCache {
    pub fn new(
        index: Arc<TileIndex>,
        backend: Arc<dyn FetchBackend>,
        policy: CachePolicy,
    ) -> Result<Self, StreamError> {
        policy.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            index,
            backend,
            policy,
            records: HashMap::new(),
            next_generation: 0,
            tx,
            rx,
            stats: CacheStats::default(),
        })
    }

    /// Apply a new visible set at time `now`.
    ///
    /// Unknown element ids fail the whole update before any tile record is
    /// touched. Fetches are started at most once per tile. Must be called
    /// from within a Tokio runtime.
    pub fn on_visibility_update(
        &mut self,
        visible: &HashSet<ElementId>,
        now: Millis,
    ) -> Result<Vec<StreamEvent>, StreamError> {
        let _span = tracing::info_span!("visibility_update", elements = visible.len(), now).entered();
        let started = Instant::now();

        let index = Arc::clone(&self.index);
        let mut tiles: HashMap<TileId, &str> = HashMap::new();
        for &element in visible {
            let tile = index.tile_for(element)?;
            if let Entry::Vacant(slot) = tiles.entry(tile) {
                slot.insert(index.geometry_file(tile)?);
            }
        }

        let mut events = self.poll_completions();
        let mut fetched = 0usize;
        for (&tile, &name) in &tiles {
            match self.records.get_mut(&tile) {
                Some(record) => {
                    record.last_visible = now;
                    if !record.visible {
                        record.visible = true;
                        record.hidden_since = None;
                        if record.is_resident() {
                            events.push(StreamEvent::TileShown(tile));
                        }
                    }
                }
                None => {
                    self.start_fetch(tile, name, now);
                    fetched += 1;
                }
            }
        }

        for (&tile, record) in self.records.iter_mut() {
            if record.visible && !tiles.contains_key(&tile) {
                record.visible = false;
                record.hidden_since = Some(now);
                if record.is_resident() {
                    events.push(StreamEvent::TileHidden(tile));
                }
            }
        }

        if self.policy.sweep_on_update {
            events.extend(self.sweep(now));
        }

        self.refresh_stats();
        self.stats.update_time = started.elapsed();
        tracing::trace!(
            visible_tiles = tiles.len(),
            fetched,
            events = events.len(),
            "visibility update complete"
        );
        Ok(events)
    }

    /// Evict records that have been out of sight for too long.
    pub fn sweep(&mut self, now: Millis) -> Vec<StreamEvent> {
        let policy = &self.policy;
        let expired: Vec<TileId> = self
            .records
            .iter()
            .filter(|(_, record)| record.expired(now, policy))
            .map(|(tile, _)| *tile)
            .collect();

        let mut events = Vec::new();
        for tile in expired {
            if let Some(record) = self.records.remove(&tile) {
                self.stats.evictions += 1;
                tracing::debug!(%tile, fetching = record.is_fetching(), now, "evicting tile");
                if record.is_resident() {
                    events.push(StreamEvent::TileEvicted(tile));
                }
            }
        }
        self.refresh_stats();
        events
    }

    /// Apply every completion that has already arrived.
    pub fn poll_completions(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            events.extend(self.apply_completion(completion));
        }
        events
    }

    /// Wait for the next completion without applying it.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Wait until no live record is fetching, applying completions as they come.
    pub async fn settle(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while self.records.values().any(TileRecord::is_fetching) {
            match self.rx.recv().await {
                Some(completion) => events.extend(self.apply_completion(completion)),
                None => break,
            }
        }
        events
    }

    pub fn apply_completion(&mut self, completion: Completion) -> Vec<StreamEvent> {
        let Completion {
            tile,
            generation,
            result,
        } = completion;
        let Some(record) = self
            .records
            .get_mut(&tile)
            .filter(|record| record.generation == generation && record.is_fetching())
        else {
            self.stats.completions_discarded += 1;
            tracing::trace!(%tile, generation, "discarding stale completion");
            return Vec::new();
        };

        let events = match result {
            Ok(content) => {
                let content = Arc::new(content);
                record.phase = Phase::Resident(Arc::clone(&content));
                self.stats.completions_applied += 1;
                tracing::debug!(%tile, elements = content.elements.len(), "tile resident");
                let mut events = vec![StreamEvent::TileLoaded { tile, content }];
                if !record.visible {
                    events.push(StreamEvent::TileHidden(tile));
                }
                events
            }
            Err(error) => {
                tracing::warn!(%tile, %error, "tile fetch failed");
                self.records.remove(&tile);
                self.stats.fetches_failed += 1;
                vec![StreamEvent::FetchFailed {
                    tile,
                    error: Arc::new(error),
                }]
            }
        };
        self.refresh_stats();
        events
    }

    /// Drop every record. Fetches still in flight are discarded on arrival.
    pub fn clear(&mut self) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_resident())
            .map(|(tile, _)| StreamEvent::TileEvicted(*tile))
            .collect();
        events.sort_by_key(|event| match event {
            StreamEvent::TileEvicted(tile) => *tile,
            _ => TileId(0),
        });
        self.stats.evictions += self.records.len() as u64;
        self.records.clear();
        self.refresh_stats();
        tracing::debug!(evicted = events.len(), "cache cleared");
        events
    }

    pub fn state(&self, tile: TileId) -> TileState {
        match self.records.get(&tile) {
            None => TileState::Unfetched,
            Some(record) => match record.phase {
                Phase::Fetching => TileState::Fetching,
                Phase::Resident(_) => TileState::Resident {
                    visible: record.visible,
                },
            },
        }
    }

    pub fn content(&self, tile: TileId) -> Option<Arc<TileContent>> {
        match &self.records.get(&tile)?.phase {
            Phase::Resident(content) => Some(Arc::clone(content)),
            Phase::Fetching => None,
        }
    }

    /// Resident tiles in id order.
    pub fn resident_tiles(&self) -> Vec<TileId> {
        let mut tiles: Vec<TileId> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_resident())
            .map(|(tile, _)| *tile)
            .collect();
        tiles.sort();
        tiles
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn index(&self) -> &Arc<TileIndex> {
        &self.index
    }

    fn start_fetch(&mut self, tile: TileId, name: &str, now: Millis) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.records.insert(
            tile,
            TileRecord {
                generation,
                phase: Phase::Fetching,
                visible: true,
                last_visible: now,
                hidden_since: None,
            },
        );
        self.stats.fetches_started += 1;
        tracing::debug!(%tile, generation, "fetching tile");

        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        let name = name.to_string();
        let expected = self
            .index
            .elements_in_tile(tile)
            .map(<[ElementId]>::to_vec)
            .unwrap_or_default();
        let limit = self.index.tile_byte_len(tile).unwrap_or_default() as usize;
        tokio::spawn(async move {
            let result = fetch_tile(backend.as_ref(), tile, &name, expected, limit).await;
            // The cache may be gone; nothing to report to then.
            let _ = tx.send(Completion {
                tile,
                generation,
                result,
            });
        });
    }

    fn refresh_stats(&mut self) {
        let (mut resident, mut fetching, mut visible) = (0, 0, 0);
        for record in self.records.values() {
            match record.phase {
                Phase::Fetching => fetching += 1,
                Phase::Resident(_) => resident += 1,
            }
            if record.visible {
                visible += 1;
            }
        }
        self.stats.resident = resident;
        self.stats.fetching = fetching;
        self.stats.visible_tiles = visible;
    }
}

async fn fetch_tile(
    backend: &dyn FetchBackend,
    tile: TileId,
    name: &str,
    mut expected: Vec<ElementId>,
    limit: usize,
) -> Result<TileContent, FetchError> {
    let bytes = backend.fetch(name).await?;
    let content = decode_tile(tile, &bytes, limit).map_err(|source| FetchError::Decode {
        name: name.to_string(),
        source,
    })?;
    let mut found: Vec<ElementId> = content.element_ids().collect();
    found.sort();
    expected.sort();
    if found != expected {
        return Err(FetchError::Mismatch {
            name: name.to_string(),
        });
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingFetcher, GatedFetcher, fixture};

    fn ids(ids: &[u32]) -> HashSet<ElementId> {
        ids.iter().map(|id| ElementId(*id)).collect()
    }

    fn policy(max_hidden_time: Millis, max_lost_time: Millis) -> CachePolicy {
        CachePolicy {
            max_hidden_time,
            max_lost_time,
            ..CachePolicy::default()
        }
    }

    #[tokio::test]
    async fn one_fetch_per_visible_tile() {
        let (index, fetcher) = fixture(&[10, 10, 5]);
        let backend = Arc::new(CountingFetcher::new(fetcher));
        let mut cache = StreamingCache::new(index, backend.clone(), CachePolicy::default()).unwrap();

        cache.on_visibility_update(&ids(&[5, 9, 12]), 0).unwrap();
        assert_eq!(cache.state(TileId(1)), TileState::Fetching);
        assert_eq!(cache.state(TileId(2)), TileState::Fetching);
        assert_eq!(cache.state(TileId(3)), TileState::Unfetched);
        assert_eq!(cache.stats().fetches_started, 2);

        // Same set again while fetching: no new requests.
        cache.on_visibility_update(&ids(&[5, 9, 12]), 1).unwrap();
        let events = cache.settle().await;
        assert_eq!(backend.count(), 2);
        let loaded = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TileLoaded { .. }))
            .count();
        assert_eq!(loaded, 2);
        assert_eq!(cache.resident_tiles(), vec![TileId(1), TileId(2)]);
        assert_eq!(cache.content(TileId(2)).unwrap().element_ids().count(), 10);
    }

    #[tokio::test]
    async fn unknown_element_fails_without_mutation() {
        let (index, fetcher) = fixture(&[2, 2]);
        let mut cache = StreamingCache::new(index, Arc::new(fetcher), CachePolicy::default()).unwrap();
        cache.on_visibility_update(&ids(&[1]), 0).unwrap();
        cache.settle().await;

        let err = cache.on_visibility_update(&ids(&[3, 9999]), 10).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Index(IndexError::UnknownElement(ElementId(9999)))
        ));
        assert_eq!(cache.state(TileId(1)), TileState::Resident { visible: true });
        assert_eq!(cache.state(TileId(2)), TileState::Unfetched);
        assert_eq!(cache.stats().fetches_started, 1);
    }

    #[tokio::test]
    async fn hidden_tile_evicted_strictly_after_max_hidden() {
        let (index, fetcher) = fixture(&[1; 8]);
        let mut cache =
            StreamingCache::new(index, Arc::new(fetcher), policy(100_000, 200_000)).unwrap();
        cache.on_visibility_update(&ids(&[7]), 0).unwrap();
        cache.settle().await;
        let events = cache.on_visibility_update(&HashSet::new(), 0).unwrap();
        assert!(matches!(events.as_slice(), [StreamEvent::TileHidden(TileId(7))]));

        assert!(cache.sweep(99_999).is_empty());
        assert!(cache.sweep(100_000).is_empty());
        assert_eq!(cache.state(TileId(7)), TileState::Resident { visible: false });

        let events = cache.sweep(100_001);
        assert!(matches!(events.as_slice(), [StreamEvent::TileEvicted(TileId(7))]));
        assert_eq!(cache.state(TileId(7)), TileState::Unfetched);
    }

    #[tokio::test]
    async fn visible_tiles_are_never_evicted() {
        let (index, fetcher) = fixture(&[1, 1]);
        let mut cache = StreamingCache::new(index, Arc::new(fetcher), policy(10, 20)).unwrap();
        cache.on_visibility_update(&ids(&[1]), 0).unwrap();
        cache.settle().await;
        assert!(cache.sweep(1_000_000).is_empty());
        assert_eq!(cache.state(TileId(1)), TileState::Resident { visible: true });
    }

    #[tokio::test]
    async fn late_completion_after_eviction_is_discarded() {
        let (index, fetcher) = fixture(&[1, 1, 1, 1]);
        let backend = Arc::new(GatedFetcher::new(fetcher));
        let mut cache = StreamingCache::new(index, backend.clone(), policy(30, 40)).unwrap();

        cache.on_visibility_update(&ids(&[4]), 0).unwrap();
        assert_eq!(cache.state(TileId(4)), TileState::Fetching);
        cache.on_visibility_update(&HashSet::new(), 10).unwrap();
        assert_eq!(cache.state(TileId(4)), TileState::Fetching);

        cache.sweep(50);
        assert_eq!(cache.state(TileId(4)), TileState::Unfetched);
        assert_eq!(cache.stats().evictions, 1);

        backend.release(1);
        let completion = cache.next_completion().await.unwrap();
        assert_eq!(completion.tile(), TileId(4));
        assert!(cache.apply_completion(completion).is_empty());
        assert_eq!(cache.state(TileId(4)), TileState::Unfetched);
        assert_eq!(cache.stats().completions_discarded, 1);
    }

    #[tokio::test]
    async fn refetch_after_eviction_ignores_old_generation() {
        let (index, fetcher) = fixture(&[1, 1]);
        let backend = Arc::new(GatedFetcher::new(fetcher));
        let mut cache = StreamingCache::new(index, backend.clone(), policy(5, 10)).unwrap();

        cache.on_visibility_update(&ids(&[2]), 0).unwrap();
        cache.on_visibility_update(&HashSet::new(), 1).unwrap();
        cache.sweep(20);
        cache.on_visibility_update(&ids(&[2]), 30).unwrap();
        assert_eq!(cache.state(TileId(2)), TileState::Fetching);

        backend.release(2);
        let events = cache.settle().await;
        assert_eq!(cache.state(TileId(2)), TileState::Resident { visible: true });
        let loaded = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TileLoaded { .. }))
            .count();
        assert_eq!(loaded, 1);
    }

    #[tokio::test]
    async fn fetch_leaving_visibility_completes_then_ages_as_hidden() {
        let (index, fetcher) = fixture(&[1, 1]);
        let backend = Arc::new(GatedFetcher::new(fetcher));
        let mut cache = StreamingCache::new(index, backend.clone(), policy(30, 1000)).unwrap();

        cache.on_visibility_update(&ids(&[1]), 0).unwrap();
        cache.on_visibility_update(&HashSet::new(), 10).unwrap();
        backend.release(1);
        let events = cache.settle().await;
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::TileLoaded { .. }, StreamEvent::TileHidden(TileId(1))]
        ));
        assert_eq!(cache.state(TileId(1)), TileState::Resident { visible: false });

        assert!(cache.sweep(40).is_empty());
        assert!(matches!(
            cache.sweep(41).as_slice(),
            [StreamEvent::TileEvicted(TileId(1))]
        ));
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_on_next_request() {
        let (index, fetcher) = fixture(&[1, 1]);
        let name = format!("{}-processed-geometries-2", crate::testing::MODEL);
        let bytes = fetcher.remove(&name).unwrap();
        let mut cache =
            StreamingCache::new(index, Arc::new(fetcher.clone()), CachePolicy::default()).unwrap();

        cache.on_visibility_update(&ids(&[2]), 0).unwrap();
        let events = cache.settle().await;
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::FetchFailed { tile: TileId(2), .. }]
        ));
        assert_eq!(cache.state(TileId(2)), TileState::Unfetched);
        assert_eq!(cache.stats().fetches_failed, 1);

        fetcher.insert(name, bytes);
        cache.on_visibility_update(&ids(&[2]), 10).unwrap();
        cache.settle().await;
        assert_eq!(cache.state(TileId(2)), TileState::Resident { visible: true });
    }

    #[tokio::test]
    async fn corrupt_tile_reports_fetch_failure() {
        let (index, fetcher) = fixture(&[1]);
        fetcher.insert(
            format!("{}-processed-geometries-1", crate::testing::MODEL),
            b"not zstd".to_vec(),
        );
        let mut cache = StreamingCache::new(index, Arc::new(fetcher), CachePolicy::default()).unwrap();
        cache.on_visibility_update(&ids(&[1]), 0).unwrap();
        let events = cache.settle().await;
        match events.as_slice() {
            [StreamEvent::FetchFailed { error, .. }] => {
                assert!(matches!(error.as_ref(), FetchError::Decode { .. }))
            }
            other => panic!("expected FetchFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tile_larger_than_manifest_lengths_fails() {
        let (index, fetcher) = fixture(&[1]);
        let mut buffer = bimtiles_common::TileBuffer::new();
        for n in 1..=64 {
            buffer.append(ElementId(1), &crate::testing::triangle_at(n as f32));
        }
        let (_, bytes) = buffer.seal().unwrap();
        fetcher.insert(format!("{}-processed-geometries-1", crate::testing::MODEL), bytes);
        let mut cache = StreamingCache::new(index, Arc::new(fetcher), CachePolicy::default()).unwrap();
        cache.on_visibility_update(&ids(&[1]), 0).unwrap();
        let events = cache.settle().await;
        match events.as_slice() {
            [StreamEvent::FetchFailed { error, .. }] => assert!(matches!(
                error.as_ref(),
                FetchError::Decode {
                    source: bimtiles_common::CodecError::TooLarge { .. },
                    ..
                }
            )),
            other => panic!("expected FetchFailed, got {other:?}"),
        }
        assert_eq!(cache.state(TileId(1)), TileState::Unfetched);
    }

    #[tokio::test]
    async fn hide_and_show_events() {
        let (index, fetcher) = fixture(&[1, 1]);
        let mut cache = StreamingCache::new(index, Arc::new(fetcher), CachePolicy::default()).unwrap();
        cache.on_visibility_update(&ids(&[1]), 0).unwrap();
        cache.settle().await;

        let events = cache.on_visibility_update(&ids(&[2]), 10).unwrap();
        assert!(matches!(events.as_slice(), [StreamEvent::TileHidden(TileId(1))]));
        cache.settle().await;

        let events = cache.on_visibility_update(&ids(&[1, 2]), 20).unwrap();
        assert!(matches!(events.as_slice(), [StreamEvent::TileShown(TileId(1))]));
        assert_eq!(cache.stats().visible_tiles, 2);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let (index, fetcher) = fixture(&[1, 1, 1]);
        let backend = Arc::new(GatedFetcher::new(fetcher));
        let mut cache = StreamingCache::new(index, backend.clone(), CachePolicy::default()).unwrap();
        cache.on_visibility_update(&ids(&[1, 2]), 0).unwrap();
        backend.release(2);
        cache.settle().await;
        cache.on_visibility_update(&ids(&[1, 2, 3]), 1).unwrap();

        let events = cache.clear();
        assert_eq!(events.len(), 2);
        assert!(cache.resident_tiles().is_empty());
        assert_eq!(cache.state(TileId(3)), TileState::Unfetched);

        backend.release(1);
        let completion = cache.next_completion().await.unwrap();
        assert!(cache.apply_completion(completion).is_empty());
        assert_eq!(cache.stats().completions_discarded, 1);
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let (index, fetcher) = fixture(&[1]);
        let result = StreamingCache::new(index, Arc::new(fetcher), policy(50, 10));
        assert!(matches!(result, Err(StreamError::Config(_))));
    }
}
