use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use terrastream_common::LayerId;

/// One GPU tile pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub layer: LayerId,
    /// Number of tile slots in the pool.
    pub tile_capacity: u32,
}

/// Tile cache tuning. Loaded from JSON; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileCacheConfig {
    /// The height layer must be present. Drawables list tiles in this order.
    pub layers: Vec<LayerConfig>,
    /// Disk uploads issued per frame.
    pub frame_upload_limit: usize,
    /// Disk uploads in flight at any time.
    pub total_active_upload_limit: usize,
    /// Failed uploads are retried this many times before the node gives up.
    pub max_upload_retries: u32,
    /// Cells unreferenced for longer than this many frames release their tiles.
    pub cell_retention_frames: u64,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            layers: vec![
                LayerConfig {
                    layer: LayerId::Heights,
                    tile_capacity: 1024,
                },
                LayerConfig {
                    layer: LayerId::Coverage(0),
                    tile_capacity: 1024,
                },
            ],
            frame_upload_limit: 500,
            total_active_upload_limit: 1000,
            max_upload_retries: 3,
            cell_retention_frames: 120,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("tile cache config has no height layer")]
    NoHeightLayer,
    #[error("layer {0:?} is configured twice")]
    DuplicateLayer(LayerId),
    #[error("layer {0:?} has no tile capacity")]
    ZeroCapacity(LayerId),
    #[error("frame upload limit must be at least one")]
    ZeroUploadLimit,
    #[error("failed to parse tile cache config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read tile cache config: {0}")]
    Io(#[from] std::io::Error),
}

impl TileCacheConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.layer) {
                return Err(ConfigError::DuplicateLayer(layer.layer));
            }
            if layer.tile_capacity == 0 {
                return Err(ConfigError::ZeroCapacity(layer.layer));
            }
        }
        if !seen.contains(&LayerId::Heights) {
            return Err(ConfigError::NoHeightLayer);
        }
        if self.frame_upload_limit == 0 || self.total_active_upload_limit == 0 {
            return Err(ConfigError::ZeroUploadLimit);
        }
        Ok(())
    }

    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.iter().map(|l| l.layer).collect()
    }
}
