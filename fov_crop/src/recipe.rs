//! Channel recipes: which source/channel pairs compose the combined image.
#![allow(missing_docs)]

use crate::row::{FovRow, SegSource};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Display color attached to a channel for downstream rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgba(pub [u8; 4]);

pub mod channel_names {
    pub const MEMBRANE: &str = "Memb";
    pub const STRUCTURE: &str = "Struct";
    pub const NUCLEUS: &str = "DNA";
    pub const BRIGHTFIELD: &str = "Bright";
    pub const NUCLEUS_SEG: &str = "Seg_DNA";
    pub const MEMBRANE_SEG: &str = "Seg_Memb";
    pub const STRUCTURE_SEG: &str = "Seg_Struct";
    pub const MEMBRANE_CONTOUR: &str = "Con_Memb";
}

mod palette {
    use super::Rgba;

    pub const MEMBRANE: Rgba = Rgba([255, 0, 255, 255]);
    pub const STRUCTURE: Rgba = Rgba([255, 255, 0, 255]);
    pub const NUCLEUS: Rgba = Rgba([0, 255, 255, 255]);
    pub const BRIGHTFIELD: Rgba = Rgba([255, 255, 255, 255]);
}

/// One entry of the channel recipe. Recipe order defines the channel order
/// of the combined image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecipeEntry {
    pub channel_name: String,
    pub source_path: PathBuf,
    pub source_channel_index: usize,
    pub color: Rgba,
    /// binarized per cell; the structure segmentation is excluded by policy
    pub mask_label: bool,
}

fn raw_entry(row: &FovRow, name: &str, channel: usize, color: Rgba) -> ChannelRecipeEntry {
    ChannelRecipeEntry {
        channel_name: name.to_string(),
        source_path: row.source_path.clone(),
        source_channel_index: channel,
        color,
        mask_label: false,
    }
}

fn seg_entry(
    source: Option<&SegSource>,
    name: &str,
    color: Rgba,
    mask_label: bool,
) -> Option<ChannelRecipeEntry> {
    source
        .filter(|source| source.is_present())
        .map(|source| ChannelRecipeEntry {
            channel_name: name.to_string(),
            source_path: source.path.clone(),
            source_channel_index: source.channel,
            color,
            mask_label,
        })
}

/// Resolve one row into the ordered recipe: the four raw channels, then
/// every segmentation/contour source present on the row. Absent optional
/// sources are simply omitted.
pub fn build_recipe(row: &FovRow) -> Vec<ChannelRecipeEntry> {
    let mut recipe = vec![
        raw_entry(row, channel_names::MEMBRANE, row.channel_membrane, palette::MEMBRANE),
        raw_entry(row, channel_names::STRUCTURE, row.channel_structure, palette::STRUCTURE),
        raw_entry(row, channel_names::NUCLEUS, row.channel_nucleus, palette::NUCLEUS),
        raw_entry(
            row,
            channel_names::BRIGHTFIELD,
            row.channel_brightfield,
            palette::BRIGHTFIELD,
        ),
    ];
    recipe.extend(seg_entry(
        row.nucleus_segmentation.as_ref(),
        channel_names::NUCLEUS_SEG,
        palette::NUCLEUS,
        true,
    ));
    recipe.extend(seg_entry(
        row.membrane_segmentation.as_ref(),
        channel_names::MEMBRANE_SEG,
        palette::MEMBRANE,
        true,
    ));
    recipe.extend(seg_entry(
        row.structure_segmentation.as_ref(),
        channel_names::STRUCTURE_SEG,
        palette::STRUCTURE,
        false,
    ));
    recipe.extend(seg_entry(
        row.membrane_contour.as_ref(),
        channel_names::MEMBRANE_CONTOUR,
        palette::MEMBRANE,
        true,
    ));
    recipe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::row_with_membrane_seg;

    #[test]
    fn test_raw_channels_always_present_in_order() {
        let mut row = row_with_membrane_seg();
        row.membrane_segmentation = None;
        let recipe = build_recipe(&row);
        let names: Vec<_> = recipe
            .iter()
            .map(|entry| entry.channel_name.as_str())
            .collect();
        assert_eq!(names, ["Memb", "Struct", "DNA", "Bright"]);
        assert!(recipe.iter().all(|entry| !entry.mask_label));
    }

    #[test]
    fn test_present_sources_are_appended() {
        let recipe = build_recipe(&row_with_membrane_seg());
        let last = recipe.last().unwrap();
        assert_eq!(last.channel_name, channel_names::MEMBRANE_SEG);
        assert!(last.mask_label);
        assert_eq!(recipe.len(), 5);
    }

    #[test]
    fn test_empty_path_source_is_omitted() {
        let mut row = row_with_membrane_seg();
        row.membrane_segmentation = Some(SegSource {
            path: PathBuf::new(),
            channel: 0,
        });
        assert_eq!(build_recipe(&row).len(), 4);
    }

    #[test]
    fn test_structure_segmentation_is_never_maskable() {
        let mut row = row_with_membrane_seg();
        row.structure_segmentation = Some(SegSource {
            path: PathBuf::from("/data/seg/struct.tiff"),
            channel: 0,
        });
        let recipe = build_recipe(&row);
        let entry = recipe
            .iter()
            .find(|entry| entry.channel_name == channel_names::STRUCTURE_SEG)
            .unwrap();
        assert!(!entry.mask_label);
    }
}
