use serde::{Deserialize, Serialize};

use crate::field::MAX_FIELDS;

/// Detail selection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Nodes whose projected edge is shorter than this (pixels) try to render one field coarser.
    pub screen_space_edge_threshold: f32,
    /// Cells closer than this seed at their finest field; each doubling of
    /// distance seeds one field coarser.
    pub detail_distance: f32,
    /// Render target size in pixels, used for screen-space edge lengths.
    pub viewport: [u32; 2],
    /// Deepest field count seeded per cell, whatever the cell carries.
    pub max_fields: u32,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            screen_space_edge_threshold: 96.0,
            detail_distance: 256.0,
            viewport: [1920, 1080],
            max_fields: 8,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LodConfigError {
    #[error("screen space edge threshold must be positive, got {0}")]
    BadThreshold(f32),
    #[error("detail distance must be positive, got {0}")]
    BadDetailDistance(f32),
    #[error("viewport {0:?} has a zero dimension")]
    EmptyViewport([u32; 2]),
    #[error("max fields must be between 1 and 16, got {0}")]
    BadMaxFields(u32),
}

impl LodConfig {
    pub fn validate(&self) -> Result<(), LodConfigError> {
        if self.screen_space_edge_threshold.is_nan() || self.screen_space_edge_threshold <= 0.0 {
            return Err(LodConfigError::BadThreshold(self.screen_space_edge_threshold));
        }
        if self.detail_distance.is_nan() || self.detail_distance <= 0.0 {
            return Err(LodConfigError::BadDetailDistance(self.detail_distance));
        }
        if self.viewport[0] == 0 || self.viewport[1] == 0 {
            return Err(LodConfigError::EmptyViewport(self.viewport));
        }
        if !(1..=MAX_FIELDS).contains(&self.max_fields) {
            return Err(LodConfigError::BadMaxFields(self.max_fields));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: LodConfig = serde_json::from_str(r#"{ "viewport": [800, 600] }"#).unwrap();
        assert_eq!(cfg.viewport, [800, 600]);
        assert_eq!(cfg.screen_space_edge_threshold, 96.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_nan_threshold() {
        let cfg = LodConfig {
            screen_space_edge_threshold: f32::NAN,
            ..LodConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(LodConfigError::BadThreshold(_))));
    }

    #[test]
    fn max_fields_bounded_by_node_numbering() {
        for max_fields in [0, MAX_FIELDS + 1] {
            let cfg = LodConfig {
                max_fields,
                ..LodConfig::default()
            };
            assert_eq!(cfg.validate(), Err(LodConfigError::BadMaxFields(max_fields)));
        }
    }
}
