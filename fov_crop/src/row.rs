//! Typed FOV row records.
//!
//! The catalog hands us loosely-typed rows; they become this struct at the
//! ingestion boundary so missing required fields fail before any image I/O.
#![allow(missing_docs)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Read path and channel index of one optional segmentation/contour source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegSource {
    pub path: PathBuf,
    #[serde(default)]
    pub channel: usize,
}

impl SegSource {
    /// A source with an empty read path counts as absent, not as an error.
    pub fn is_present(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }
}

/// One catalog row describing a field of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FovRow {
    pub fov_id: i64,
    pub fov_name: String,
    /// primary multi-channel acquisition
    pub source_path: PathBuf,
    pub channel_membrane: usize,
    pub channel_structure: usize,
    pub channel_nucleus: usize,
    pub channel_brightfield: usize,
    #[serde(default)]
    pub nucleus_segmentation: Option<SegSource>,
    #[serde(default)]
    pub membrane_segmentation: Option<SegSource>,
    #[serde(default)]
    pub structure_segmentation: Option<SegSource>,
    #[serde(default)]
    pub membrane_contour: Option<SegSource>,
    pub pixel_size_x: f64,
    pub pixel_size_y: f64,
    pub pixel_size_z: f64,
    #[serde(default)]
    pub cell_line: Option<String>,
    #[serde(default)]
    pub well_name: Option<String>,
}

impl FovRow {
    /// Deserialize one row, reporting missing required fields up front.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid FOV row record")
    }
}
