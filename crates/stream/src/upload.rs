use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use terrastream_common::{LayerId, UberRegion};

use crate::scaffold::Compression;
use crate::tile_set::TileHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(pub u64);

/// Opaque handle to an editor-owned GPU view holding freshly edited data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceViewId(pub u64);

/// Maps stored samples back to world heights: `height = min + sample * scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightRemap {
    pub min: f32,
    pub scale: f32,
}

impl Default for HeightRemap {
    fn default() -> Self {
        Self { min: 0.0, scale: 1.0 }
    }
}

impl HeightRemap {
    pub fn from_compression(compression: Compression) -> Self {
        match compression {
            Compression::None => Self::default(),
            Compression::Quantized { min, scale } => Self { min, scale },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UploadSource {
    /// Read a node payload from the cell's source file.
    File { file_offset: u64, data_size: u32 },
    /// Copy `region` of an edited view over the destination tile.
    Patch { view: ResourceViewId, region: UberRegion },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadRequest {
    pub layer: LayerId,
    pub destination: TileHandle,
    pub source: UploadSource,
    pub dimensions_in_elements: u32,
    pub compression: Compression,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UploadStatus {
    Pending,
    /// The tile is populated. Patches of height tiles may report a new remap
    /// when the edit widened the height range.
    Done { height_remap: Option<HeightRemap> },
    Failed,
}

/// Asynchronous transfer of tile data into GPU slots.
///
/// Completion is observed by polling; once `Done` or `Failed` has been
/// returned for an id the service may forget it.
pub trait UploadService {
    fn request_upload(&mut self, request: UploadRequest) -> UploadId;
    fn poll_completion(&mut self, id: UploadId) -> UploadStatus;
}

/// In-process upload service that completes requests after a fixed number of
/// polls and records what landed in each physical slot.
///
/// Used by the CLI simulator and the tests; failures can be scripted.
#[derive(Debug, Default)]
pub struct SimulatedUploads {
    next_id: u64,
    latency: u32,
    requests: HashMap<UploadId, (UploadRequest, u32)>,
    fail_files: u32,
    fail_patches: u32,
    failing: HashSet<UploadId>,
    contents: HashMap<(LayerId, u32), Vec<UploadSource>>,
    overlapping: u64,
    log: Vec<UploadRequest>,
}

impl SimulatedUploads {
    /// `latency` is the number of polls that report `Pending` before a
    /// request completes.
    pub fn new(latency: u32) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Fail the next `count` file reads.
    pub fn fail_next_files(&mut self, count: u32) {
        self.fail_files += count;
    }

    /// Fail the next `count` patches.
    pub fn fail_next_patches(&mut self, count: u32) {
        self.fail_patches += count;
    }

    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Sources applied to the tile's slot since its last file read, oldest first.
    pub fn contents(&self, layer: LayerId, tile: TileHandle) -> &[UploadSource] {
        self.contents.get(&(layer, tile.slot)).map_or(&[], |v| v.as_slice())
    }

    /// Requests issued while a transfer for an older owner of the same slot
    /// was still in flight.
    pub fn overlapping_requests(&self) -> u64 {
        self.overlapping
    }

    /// Every request seen so far, oldest first.
    pub fn requests(&self) -> impl Iterator<Item = &UploadRequest> {
        self.log.iter()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

impl UploadService for SimulatedUploads {
    fn request_upload(&mut self, request: UploadRequest) -> UploadId {
        let id = UploadId(self.next_id);
        self.next_id += 1;

        let fail = match request.source {
            UploadSource::File { .. } => &mut self.fail_files,
            UploadSource::Patch { .. } => &mut self.fail_patches,
        };
        if *fail > 0 {
            *fail -= 1;
            self.failing.insert(id);
        }
        let destination = request.destination;
        let overlaps = self.requests.values().any(|(r, _)| {
            r.layer == request.layer
                && r.destination.slot == destination.slot
                && r.destination.generation != destination.generation
        });
        if overlaps {
            self.overlapping += 1;
        }
        self.requests.insert(id, (request, self.latency));
        self.log.push(request);
        id
    }

    fn poll_completion(&mut self, id: UploadId) -> UploadStatus {
        let Some((request, remaining)) = self.requests.get_mut(&id) else {
            return UploadStatus::Failed;
        };
        if *remaining > 0 {
            *remaining -= 1;
            return UploadStatus::Pending;
        }
        let request = *request;
        self.requests.remove(&id);
        if self.failing.remove(&id) {
            return UploadStatus::Failed;
        }

        let tile = self.contents.entry((request.layer, request.destination.slot)).or_default();
        if let UploadSource::File { .. } = request.source {
            tile.clear();
        }
        tile.push(request.source);
        UploadStatus::Done { height_remap: None }
    }
}
