use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use terrastream_common::{CellCoord, LayerId, UberRegion};
use terrastream_lod::ActiveNode;

use crate::bridge::{ShortCircuitAbandon, ShortCircuitBridge, ShortCircuitQueue, ShortCircuitUpdate};
use crate::config::{ConfigError, TileCacheConfig};
use crate::scaffold::{CellScaffold, NodeSource, ScaffoldSource};
use crate::tile_set::{TileHandle, TileSet};
use crate::upload::{HeightRemap, ResourceViewId, UploadId, UploadRequest, UploadService, UploadSource, UploadStatus};

/// Edited data waiting to be copied over a node's tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredEdit {
    pub region: UberRegion,
    pub view: ResourceViewId,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingStage {
    Disk(UploadId),
    /// Disk data landed; edits are being copied over it before commit.
    Patching(Vec<UploadId>),
}

/// A tile being filled in the background. The committed tile stays in use
/// until this one is complete.
#[derive(Debug, Clone, PartialEq)]
struct PendingTile {
    tile: TileHandle,
    stage: PendingStage,
    edits: Vec<DeferredEdit>,
    remap: HeightRemap,
    reload: bool,
}

/// Streaming state of one node in one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCoverageInfo {
    source: NodeSource,
    region: UberRegion,
    committed: Option<TileHandle>,
    height_remap: HeightRemap,
    pending: Option<PendingTile>,
    patches: Vec<(UploadId, DeferredEdit)>,
    deferred: Vec<DeferredEdit>,
    needs_reload: bool,
    retries: u32,
    given_up: bool,
}

impl NodeCoverageInfo {
    fn new(source: NodeSource, region: UberRegion) -> Self {
        Self {
            source,
            region,
            committed: None,
            height_remap: HeightRemap::from_compression(source.compression),
            pending: None,
            patches: Vec::new(),
            deferred: Vec::new(),
            needs_reload: false,
            retries: 0,
            given_up: false,
        }
    }

    pub fn source(&self) -> &NodeSource {
        &self.source
    }

    pub fn region(&self) -> UberRegion {
        self.region
    }

    /// The tile drawn for this node. May be stale if the slot was evicted;
    /// check it against the layer's [`TileSet`].
    pub fn committed(&self) -> Option<TileHandle> {
        self.committed
    }

    pub fn pending_tile(&self) -> Option<TileHandle> {
        self.pending.as_ref().map(|p| p.tile)
    }

    pub fn height_remap(&self) -> HeightRemap {
        self.height_remap
    }

    /// The committed tile has edits copying over it.
    pub fn is_dirty(&self) -> bool {
        !self.patches.is_empty()
    }

    pub fn needs_reload(&self) -> bool {
        self.needs_reload
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn has_given_up(&self) -> bool {
        self.given_up
    }

    /// Edits held back until the next disk upload lands, including those
    /// attached to the one in flight.
    pub fn deferred_edits(&self) -> Vec<DeferredEdit> {
        let mut out = self.deferred.clone();
        if let Some(pending) = &self.pending {
            out.extend(pending.edits.iter().copied());
        }
        out
    }

    fn commit(&mut self, tiles: &mut TileSet) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match self.committed.replace(pending.tile) {
            Some(old) if old != pending.tile => {
                tiles.release(old);
            }
            _ => {}
        }
        self.height_remap = pending.remap;
        self.retries = 0;
    }

    /// Drop the pending tile's bookkeeping; its edits wait for the next attempt.
    fn requeue(&mut self, pending: PendingTile) {
        for edit in pending.edits {
            push_edit(&mut self.deferred, edit);
        }
        if pending.reload {
            self.needs_reload = true;
        }
    }
}

/// Per-cell streaming state, created lazily the first frame the cell is
/// referenced.
#[derive(Debug, Clone)]
pub struct CellRenderInfo {
    scaffold: Arc<CellScaffold>,
    /// Indexed like the configured layers.
    layers: Vec<BTreeMap<u32, NodeCoverageInfo>>,
    last_referenced: u64,
}

impl CellRenderInfo {
    pub fn scaffold(&self) -> &CellScaffold {
        &self.scaffold
    }

    pub fn last_referenced(&self) -> u64 {
        self.last_referenced
    }

    pub fn resident_nodes(&self, layer: usize) -> usize {
        self.layers.get(layer).map_or(0, |nodes| nodes.len())
    }
}

/// What to draw for one active node. `tiles` follows the configured layer
/// order; `None` means the layer has nothing committed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Drawable {
    pub node: ActiveNode,
    pub tiles: Vec<Option<TileHandle>>,
    pub height_remap: HeightRemap,
}

impl Drawable {
    /// The height tile is resident, so the node can be drawn at all.
    pub fn is_ready(&self) -> bool {
        self.tiles.first().is_some_and(|t| t.is_some())
    }
}

/// Cumulative counters plus gauges refreshed every frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub frame: u64,
    pub resident_cells: usize,
    pub disk_uploads_in_flight: usize,
    pub uploads_issued: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
    pub patches_issued: u64,
    pub patches_completed: u64,
    pub evictions: u64,
    pub capacity_misses: u64,
    pub stale_completions: u64,
    pub reloads: u64,
    pub scaffold_failures: u64,
    pub cells_released: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadKind {
    Disk,
    PendingPatch,
    CommittedPatch,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    cell: CellCoord,
    layer: usize,
    node: u32,
    tile: TileHandle,
    kind: UploadKind,
}

struct Candidate {
    cell: CellCoord,
    layer: usize,
    node: u32,
    priority: f32,
}

/// Keeps the tiles of the active nodes resident, streaming them from disk
/// and merging editor short-circuits over them.
///
/// Each [`TileCache::update`] runs one frame:
/// 1. drain the short-circuit bridge,
/// 2. poll in-flight uploads and commit finished tiles,
/// 3. apply abandons, marking affected nodes for reload,
/// 4. admit the active nodes and queue disk uploads by priority,
/// 5. merge short-circuit updates into resident and loading tiles,
/// 6. release cells nobody referenced within the retention window.
pub struct TileCache<S, U> {
    config: TileCacheConfig,
    scaffolds: S,
    uploads: U,
    bridge: ShortCircuitBridge,
    tile_sets: Vec<TileSet>,
    cells: HashMap<CellCoord, CellRenderInfo>,
    in_flight: HashMap<UploadId, InFlight>,
    disk_in_flight: usize,
    frame: u64,
    stats: CacheStats,
}

impl<S: ScaffoldSource, U: UploadService> TileCache<S, U> {
    pub fn new(config: TileCacheConfig, scaffolds: S, uploads: U) -> Result<Self, ConfigError> {
        config.validate()?;
        let tile_sets = config
            .layers
            .iter()
            .map(|l| TileSet::new(l.layer, l.tile_capacity))
            .collect();
        Ok(Self {
            config,
            scaffolds,
            uploads,
            bridge: ShortCircuitBridge::new(),
            tile_sets,
            cells: HashMap::new(),
            in_flight: HashMap::new(),
            disk_in_flight: 0,
            frame: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn config(&self) -> &TileCacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Producer handle for editor threads.
    pub fn short_circuit_queue(&self) -> ShortCircuitQueue {
        self.bridge.queue()
    }

    pub fn queue_short_circuit(&self, layer: LayerId, region: UberRegion, view: ResourceViewId) {
        self.bridge.queue_short_circuit(layer, region, view);
    }

    pub fn queue_abandon(&self, layer: LayerId, region: UberRegion) {
        self.bridge.queue_abandon(layer, region);
    }

    pub fn uploads(&self) -> &U {
        &self.uploads
    }

    pub fn uploads_mut(&mut self) -> &mut U {
        &mut self.uploads
    }

    pub fn scaffolds_mut(&mut self) -> &mut S {
        &mut self.scaffolds
    }

    pub fn tile_set(&self, layer: LayerId) -> Option<&TileSet> {
        self.tile_sets.iter().find(|s| s.layer() == layer)
    }

    pub fn cell(&self, coord: CellCoord) -> Option<&CellRenderInfo> {
        self.cells.get(&coord)
    }

    pub fn resident_cells(&self) -> impl Iterator<Item = CellCoord> + '_ {
        self.cells.keys().copied()
    }

    pub fn node_info(&self, coord: CellCoord, layer: LayerId, node: u32) -> Option<&NodeCoverageInfo> {
        let li = self.layer_index(layer)?;
        self.cells.get(&coord)?.layers[li].get(&node)
    }

    /// Committed tile for a node, only if it is still resident.
    pub fn resident_tile(&self, coord: CellCoord, layer: LayerId, node: u32) -> Option<TileHandle> {
        let li = self.layer_index(layer)?;
        let tile = self.cells.get(&coord)?.layers[li].get(&node)?.committed?;
        self.tile_sets[li].is_valid(tile).then_some(tile)
    }

    /// Run one frame for the given active nodes and return what to draw.
    pub fn update(&mut self, active: &[ActiveNode]) -> Vec<Drawable> {
        self.frame += 1;
        let _span = tracing::info_span!("tile_cache_update", frame = self.frame, active = active.len()).entered();

        let edits = self.bridge.drain();
        self.poll_uploads();
        for abandon in &edits.abandons {
            self.apply_abandon(abandon);
        }
        self.admit(active);
        self.flush_deferred();
        for update in &edits.updates {
            self.apply_update(update);
        }
        self.release_unreferenced_cells();

        self.stats.frame = self.frame;
        self.stats.resident_cells = self.cells.len();
        self.stats.disk_uploads_in_flight = self.disk_in_flight;
        tracing::debug!(
            resident_cells = self.stats.resident_cells,
            in_flight = self.in_flight.len(),
            "tile cache frame complete"
        );
        self.drawables(active)
    }

    fn layer_index(&self, layer: LayerId) -> Option<usize> {
        self.tile_sets.iter().position(|s| s.layer() == layer)
    }

    fn poll_uploads(&mut self) {
        let mut ids: Vec<UploadId> = self.in_flight.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let status = self.uploads.poll_completion(id);
            if status == UploadStatus::Pending {
                continue;
            }
            let Some(target) = self.in_flight.remove(&id) else {
                continue;
            };
            self.tile_sets[target.layer].end_upload(target.tile);
            if target.kind == UploadKind::Disk {
                self.disk_in_flight = self.disk_in_flight.saturating_sub(1);
            }
            self.complete(id, target, status);
        }
    }

    fn complete(&mut self, id: UploadId, target: InFlight, status: UploadStatus) {
        let Self {
            config,
            uploads,
            tile_sets,
            cells,
            in_flight,
            stats,
            ..
        } = self;
        let tiles = &mut tile_sets[target.layer];
        let layer = tiles.layer();
        let Some(node) = cells
            .get_mut(&target.cell)
            .and_then(|c| c.layers[target.layer].get_mut(&target.node))
        else {
            stats.stale_completions += 1;
            return;
        };

        if target.kind == UploadKind::CommittedPatch {
            let Some(pos) = node.patches.iter().position(|(p, _)| *p == id) else {
                stats.stale_completions += 1;
                return;
            };
            let (_, edit) = node.patches.remove(pos);
            if node.committed != Some(target.tile) || !tiles.is_valid(target.tile) {
                stats.stale_completions += 1;
                return;
            }
            match status {
                UploadStatus::Done { height_remap } => {
                    if let Some(remap) = height_remap {
                        node.height_remap = remap;
                    }
                    stats.patches_completed += 1;
                }
                _ => {
                    stats.uploads_failed += 1;
                    node.retries += 1;
                    if node.retries <= config.max_upload_retries {
                        tracing::warn!(cell = ?target.cell, node = target.node, ?layer, "short-circuit patch failed, retrying");
                        push_edit(&mut node.deferred, edit);
                    } else {
                        tracing::warn!(cell = ?target.cell, node = target.node, ?layer, "short-circuit patch failed, dropping edit");
                    }
                }
            }
            return;
        }

        let owned = node.pending.as_ref().is_some_and(|p| {
            p.tile == target.tile
                && match &p.stage {
                    PendingStage::Disk(d) => *d == id,
                    PendingStage::Patching(ids) => ids.contains(&id),
                }
        });
        if !owned {
            stats.stale_completions += 1;
            return;
        }
        if !tiles.is_valid(target.tile) {
            // Released while loading.
            if let Some(pending) = node.pending.take() {
                node.requeue(pending);
            }
            stats.stale_completions += 1;
            return;
        }

        let UploadStatus::Done { height_remap } = status else {
            if let Some(pending) = node.pending.take() {
                tiles.release(pending.tile);
                node.requeue(pending);
            }
            stats.uploads_failed += 1;
            node.retries += 1;
            if node.retries > config.max_upload_retries {
                node.given_up = true;
                node.needs_reload = false;
                tracing::warn!(cell = ?target.cell, node = target.node, ?layer, retries = node.retries, "tile upload failed, giving up");
            } else {
                tracing::warn!(cell = ?target.cell, node = target.node, ?layer, retries = node.retries, "tile upload failed, will retry");
            }
            return;
        };

        let source = node.source;
        let region = node.region;
        let Some(pending) = node.pending.as_mut() else {
            return;
        };
        if let Some(remap) = height_remap {
            pending.remap = remap;
        }
        let ready = if let PendingStage::Patching(ids) = &mut pending.stage {
            ids.retain(|i| *i != id);
            stats.patches_completed += 1;
            ids.is_empty()
        } else {
            stats.uploads_completed += 1;
            if pending.edits.is_empty() {
                true
            } else {
                let tile = pending.tile;
                let ids = pending
                    .edits
                    .iter()
                    .map(|edit| {
                        let request = patch_request(layer, tile, &source, region, edit);
                        let id = uploads.request_upload(request);
                        tiles.begin_upload(tile);
                        in_flight.insert(
                            id,
                            InFlight {
                                kind: UploadKind::PendingPatch,
                                ..target
                            },
                        );
                        id
                    })
                    .collect::<Vec<_>>();
                stats.patches_issued += ids.len() as u64;
                pending.stage = PendingStage::Patching(ids);
                false
            }
        };
        if ready {
            node.commit(tiles);
        }
    }

    fn apply_abandon(&mut self, abandon: &ShortCircuitAbandon) {
        let Some(li) = self.layer_index(abandon.layer) else {
            tracing::debug!(layer = ?abandon.layer, "abandon for unconfigured layer ignored");
            return;
        };
        let tiles = &self.tile_sets[li];
        for cell in self.cells.values_mut() {
            for node in cell.layers[li].values_mut() {
                if !touches(&node.region, &abandon.region) {
                    continue;
                }
                node.deferred.retain(|e| !abandon.region.contains(&e.region));
                let mut reload = node.committed.is_some_and(|t| tiles.is_valid(t));
                if let Some(pending) = node.pending.as_mut() {
                    pending.edits.retain(|e| !abandon.region.contains(&e.region));
                    reload |= matches!(pending.stage, PendingStage::Patching(_));
                }
                if reload && !node.given_up && !node.needs_reload {
                    node.needs_reload = true;
                    self.stats.reloads += 1;
                }
            }
        }
    }

    fn admit(&mut self, active: &[ActiveNode]) {
        let frame = self.frame;

        // Promoted siblings share their parent's tiles.
        let mut order: Vec<(CellCoord, u32)> = Vec::new();
        let mut priorities: HashMap<(CellCoord, u32), f32> = HashMap::new();
        for node in active {
            let key = (node.cell, node.tile_node);
            match priorities.get_mut(&key) {
                Some(p) => *p = p.max(node.priority),
                None => {
                    priorities.insert(key, node.priority);
                    order.push(key);
                }
            }
        }

        let mut failed_cells = HashSet::new();
        let mut candidates = Vec::new();
        for (coord, tile_node) in order {
            if failed_cells.contains(&coord) {
                continue;
            }
            if !self.cells.contains_key(&coord) {
                match self.scaffolds.load_scaffold(coord) {
                    Ok(scaffold) => {
                        tracing::debug!(?coord, "cell admitted");
                        self.cells.insert(
                            coord,
                            CellRenderInfo {
                                scaffold,
                                layers: vec![BTreeMap::new(); self.tile_sets.len()],
                                last_referenced: frame,
                            },
                        );
                    }
                    Err(err) => {
                        tracing::warn!(?coord, %err, "cell scaffold unavailable");
                        self.stats.scaffold_failures += 1;
                        failed_cells.insert(coord);
                        continue;
                    }
                }
            }
            let Some(cell) = self.cells.get_mut(&coord) else {
                continue;
            };
            cell.last_referenced = frame;
            let priority = priorities.get(&(coord, tile_node)).copied().unwrap_or(0.0);

            for (li, tiles) in self.tile_sets.iter_mut().enumerate() {
                let Some(layer) = cell.scaffold.layer(tiles.layer()) else {
                    continue;
                };
                let (Some(source), Some(region)) = (layer.node_source(tile_node).copied(), layer.node_region(tile_node))
                else {
                    continue;
                };
                let node = cell.layers[li]
                    .entry(tile_node)
                    .or_insert_with(|| NodeCoverageInfo::new(source, region));

                let resident = node.committed.is_some_and(|t| tiles.touch(t, frame));
                if !resident {
                    node.committed = None;
                }
                if let Some(pending) = &node.pending {
                    tiles.touch(pending.tile, frame);
                }
                if node.given_up || node.pending.is_some() {
                    continue;
                }
                if !resident || node.needs_reload {
                    candidates.push(Candidate {
                        cell: coord,
                        layer: li,
                        node: tile_node,
                        priority,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        let mut issued = 0;
        for candidate in candidates {
            if issued >= self.config.frame_upload_limit
                || self.disk_in_flight >= self.config.total_active_upload_limit
            {
                break;
            }
            let tiles = &mut self.tile_sets[candidate.layer];
            let Some(allocation) = tiles.allocate(frame) else {
                self.stats.capacity_misses += 1;
                continue;
            };
            if allocation.evicted.is_some() {
                self.stats.evictions += 1;
            }
            let Some(node) = self
                .cells
                .get_mut(&candidate.cell)
                .and_then(|c| c.layers[candidate.layer].get_mut(&candidate.node))
            else {
                tiles.release(allocation.handle);
                continue;
            };

            let request = UploadRequest {
                layer: tiles.layer(),
                destination: allocation.handle,
                source: UploadSource::File {
                    file_offset: node.source.file_offset,
                    data_size: node.source.data_size,
                },
                dimensions_in_elements: node.source.dimensions_in_elements,
                compression: node.source.compression,
            };
            let id = self.uploads.request_upload(request);
            tiles.begin_upload(allocation.handle);
            self.in_flight.insert(
                id,
                InFlight {
                    cell: candidate.cell,
                    layer: candidate.layer,
                    node: candidate.node,
                    tile: allocation.handle,
                    kind: UploadKind::Disk,
                },
            );
            self.disk_in_flight += 1;

            let reload = node.committed.is_some();
            node.pending = Some(PendingTile {
                tile: allocation.handle,
                stage: PendingStage::Disk(id),
                edits: std::mem::take(&mut node.deferred),
                remap: HeightRemap::from_compression(node.source.compression),
                reload,
            });
            node.needs_reload = false;
            issued += 1;
            self.stats.uploads_issued += 1;
        }
        if issued > 0 {
            tracing::debug!(issued, in_flight = self.disk_in_flight, "disk uploads queued");
        }
    }

    /// Re-issue edits parked on resident nodes that have no reload coming.
    fn flush_deferred(&mut self) {
        let Self {
            uploads,
            tile_sets,
            cells,
            in_flight,
            stats,
            ..
        } = self;
        for (&coord, cell) in cells.iter_mut() {
            for (li, nodes) in cell.layers.iter_mut().enumerate() {
                let tiles = &mut tile_sets[li];
                for (&node_index, node) in nodes.iter_mut() {
                    if node.deferred.is_empty() || node.pending.is_some() || node.needs_reload {
                        continue;
                    }
                    let Some(tile) = node.committed.filter(|t| tiles.is_valid(*t)) else {
                        if node.given_up {
                            node.deferred.clear();
                        }
                        continue;
                    };
                    for edit in std::mem::take(&mut node.deferred) {
                        let request = patch_request(tiles.layer(), tile, &node.source, node.region, &edit);
                        let id = uploads.request_upload(request);
                        tiles.begin_upload(tile);
                        in_flight.insert(
                            id,
                            InFlight {
                                cell: coord,
                                layer: li,
                                node: node_index,
                                tile,
                                kind: UploadKind::CommittedPatch,
                            },
                        );
                        node.patches.push((id, edit));
                        stats.patches_issued += 1;
                    }
                }
            }
        }
    }

    fn apply_update(&mut self, update: &ShortCircuitUpdate) {
        let Some(li) = self.layer_index(update.layer) else {
            tracing::debug!(layer = ?update.layer, "short-circuit for unconfigured layer ignored");
            return;
        };
        let Self {
            uploads,
            tile_sets,
            cells,
            in_flight,
            stats,
            ..
        } = self;
        let tiles = &mut tile_sets[li];
        let edit = DeferredEdit {
            region: update.region,
            view: update.view,
        };

        let mut merged = 0usize;
        for (&coord, cell) in cells.iter_mut() {
            let overlaps_cell = cell
                .scaffold
                .layer(update.layer)
                .is_some_and(|l| touches(&l.uber_region, &update.region));
            if !overlaps_cell {
                continue;
            }
            for (&node_index, node) in cell.layers[li].iter_mut() {
                if !touches(&node.region, &update.region) {
                    continue;
                }
                let flight = |tile, kind| InFlight {
                    cell: coord,
                    layer: li,
                    node: node_index,
                    tile,
                    kind,
                };

                if let Some(pending) = node.pending.as_mut() {
                    push_edit(&mut pending.edits, edit);
                    // Disk data already landed: copy the edit in before commit.
                    if let PendingStage::Patching(ids) = &mut pending.stage {
                        let request = patch_request(tiles.layer(), pending.tile, &node.source, node.region, &edit);
                        let id = uploads.request_upload(request);
                        tiles.begin_upload(pending.tile);
                        in_flight.insert(id, flight(pending.tile, UploadKind::PendingPatch));
                        ids.push(id);
                        stats.patches_issued += 1;
                    }
                } else if node.needs_reload {
                    push_edit(&mut node.deferred, edit);
                } else if let Some(tile) = node.committed.filter(|t| tiles.is_valid(*t)) {
                    let request = patch_request(tiles.layer(), tile, &node.source, node.region, &edit);
                    let id = uploads.request_upload(request);
                    tiles.begin_upload(tile);
                    in_flight.insert(id, flight(tile, UploadKind::CommittedPatch));
                    node.patches.push((id, edit));
                    stats.patches_issued += 1;
                } else {
                    continue;
                }
                merged += 1;
            }
        }
        tracing::trace!(layer = ?update.layer, region = ?update.region, merged, "short-circuit merged");
    }

    fn release_unreferenced_cells(&mut self) {
        let frame = self.frame;
        let retention = self.config.cell_retention_frames;
        let expired: Vec<CellCoord> = self
            .cells
            .iter()
            .filter(|(_, cell)| frame.saturating_sub(cell.last_referenced) > retention)
            .map(|(coord, _)| *coord)
            .collect();
        for coord in expired {
            let Some(cell) = self.cells.remove(&coord) else {
                continue;
            };
            for (li, nodes) in cell.layers.iter().enumerate() {
                let tiles = &mut self.tile_sets[li];
                for node in nodes.values() {
                    if let Some(tile) = node.committed {
                        tiles.release(tile);
                    }
                    if let Some(pending) = &node.pending {
                        tiles.release(pending.tile);
                    }
                }
            }
            self.stats.cells_released += 1;
            tracing::debug!(?coord, "cell released");
        }
    }

    fn drawables(&self, active: &[ActiveNode]) -> Vec<Drawable> {
        let heights = self.layer_index(LayerId::Heights);
        active
            .iter()
            .map(|node| {
                let cell = self.cells.get(&node.cell);
                let info = |li: usize| cell.and_then(|c| c.layers[li].get(&node.tile_node));
                let tiles = self
                    .tile_sets
                    .iter()
                    .enumerate()
                    .map(|(li, set)| info(li).and_then(|n| n.committed).filter(|t| set.is_valid(*t)))
                    .collect();
                let height_remap = heights
                    .and_then(info)
                    .map_or_else(HeightRemap::default, |n| n.height_remap);
                Drawable {
                    node: node.clone(),
                    tiles,
                    height_remap,
                }
            })
            .collect()
    }
}

/// Edits replace earlier ones for the same region.
fn push_edit(edits: &mut Vec<DeferredEdit>, edit: DeferredEdit) {
    match edits.iter_mut().find(|e| e.region == edit.region) {
        Some(existing) => existing.view = edit.view,
        None => edits.push(edit),
    }
}

/// Node tiles carry a one element border shared with their neighbours.
fn grow(region: &UberRegion) -> UberRegion {
    UberRegion::new(
        [region.mins[0].saturating_sub(1), region.mins[1].saturating_sub(1)],
        [region.maxs[0].saturating_add(1), region.maxs[1].saturating_add(1)],
    )
}

fn touches(node_region: &UberRegion, edit: &UberRegion) -> bool {
    grow(node_region).intersects(edit)
}

fn patch_request(
    layer: LayerId,
    destination: TileHandle,
    source: &NodeSource,
    node_region: UberRegion,
    edit: &DeferredEdit,
) -> UploadRequest {
    let region = grow(&node_region).intersection(&edit.region).unwrap_or(edit.region);
    UploadRequest {
        layer,
        destination,
        source: UploadSource::Patch {
            view: edit.view,
            region,
        },
        dimensions_in_elements: source.dimensions_in_elements,
        compression: source.compression,
    }
}
