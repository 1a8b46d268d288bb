//! Load and stack per-channel volumes into one combined image.
#![allow(missing_docs)]

use crate::errors::{MissingChannelError, ShapeMismatchError};
use crate::reader::ReaderProvider;
use crate::recipe::ChannelRecipeEntry;
use anyhow::{bail, Context, Result};
use ndarray::{stack, Array3, Array4, ArrayBase, ArrayView3, Axis};

/// One FOV's channels stacked (C,Z,Y,X). Built once per FOV and read-only
/// thereafter; the full-field artifact and every cell crop derive from it.
#[derive(Debug, Clone)]
pub struct CombinedImage {
    pub data: Array4<u16>,
    pub channel_names: Vec<String>,
    /// per channel, whether it is binarized per cell
    pub mask_flags: Vec<bool>,
}

impl CombinedImage {
    pub fn channel(&self, index: usize) -> ArrayView3<'_, u16> {
        self.data.index_axis(Axis(0), index)
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channel_names
            .iter()
            .position(|channel| channel == name)
    }

    /// Extent of every channel plane, (Z,Y,X).
    pub fn shape_zyx(&self) -> (usize, usize, usize) {
        let (_, z, y, x) = self.data.dim();
        (z, y, x)
    }

    /// Retain only the channels at `ordered_indices`, in that order.
    pub fn select_channels(&self, ordered_indices: &[usize]) -> Result<CombinedImage> {
        if let Some(&bad) = ordered_indices
            .iter()
            .find(|&&index| index >= self.channel_names.len())
        {
            bail!(
                "channel index {bad} out of range for {} combined channels",
                self.channel_names.len()
            );
        }
        Ok(CombinedImage {
            data: self.data.select(Axis(0), ordered_indices),
            channel_names: ordered_indices
                .iter()
                .map(|&index| self.channel_names[index].clone())
                .collect(),
            mask_flags: ordered_indices
                .iter()
                .map(|&index| self.mask_flags[index])
                .collect(),
        })
    }
}

/// Load every recipe entry and stack the volumes in recipe order.
///
/// The first entry fixes the reference shape; any later disagreement is a
/// [`ShapeMismatchError`] and nothing is silently resized. Also returns the
/// primary source's raw metadata text, captured while its handle is open.
pub fn build_combined(
    recipe: &[ChannelRecipeEntry],
    provider: &dyn ReaderProvider,
) -> Result<(CombinedImage, Option<String>)> {
    if recipe.is_empty() {
        bail!("channel recipe is empty");
    }
    let mut volumes: Vec<Array3<u16>> = Vec::with_capacity(recipe.len());
    let mut metadata_text = None;
    let mut reference_shape = None;
    for entry in recipe {
        let mut reader = provider.open(&entry.source_path).with_context(|| {
            format!("opening the source for channel '{}'", entry.channel_name)
        })?;
        if entry.source_channel_index >= reader.channel_count() {
            return Err(MissingChannelError {
                path: entry.source_path.clone(),
                requested: entry.source_channel_index,
                available: reader.channel_count(),
            }
            .into());
        }
        let volume = reader.read_channel(entry.source_channel_index)?;
        match reference_shape {
            None => {
                reference_shape = Some(volume.dim());
                metadata_text = reader.metadata_text().map(String::from);
            }
            Some(expected) if volume.dim() != expected => {
                return Err(ShapeMismatchError {
                    channel: entry.channel_name.clone(),
                    path: entry.source_path.clone(),
                    expected,
                    found: volume.dim(),
                }
                .into());
            }
            Some(_) => {}
        }
        volumes.push(volume);
        // the reader drops here, closing its handle before the next source
    }
    let views: Vec<_> = volumes.iter().map(ArrayBase::view).collect();
    let data = stack(Axis(0), &views)?;
    Ok((
        CombinedImage {
            data,
            channel_names: recipe
                .iter()
                .map(|entry| entry.channel_name.clone())
                .collect(),
            mask_flags: recipe.iter().map(|entry| entry.mask_label).collect(),
        },
        metadata_text,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::build_recipe;
    use crate::testing::{row_with_membrane_seg, FakeProvider};
    use ndarray::Array3;

    #[test]
    fn test_channels_stack_in_recipe_order() -> Result<()> {
        let row = row_with_membrane_seg();
        let provider = FakeProvider::for_row(&row, (4, 16, 16));
        let (combined, metadata_text) = build_combined(&build_recipe(&row), &provider)?;
        assert_eq!(combined.data.dim(), (5, 4, 16, 16));
        assert_eq!(combined.channel_names.len(), 5);
        assert_eq!(combined.mask_flags, [false, false, false, false, true]);
        assert!(metadata_text.is_some());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_names_the_offender() {
        let row = row_with_membrane_seg();
        let mut provider = FakeProvider::for_row(&row, (4, 16, 16));
        provider.replace_volume(
            row.membrane_segmentation.as_ref().unwrap().path.clone(),
            Array3::<u16>::zeros((4, 16, 8)),
        );
        let err = build_combined(&build_recipe(&row), &provider).unwrap_err();
        let mismatch = err.downcast_ref::<ShapeMismatchError>().unwrap();
        assert_eq!(mismatch.channel, "Seg_Memb");
        assert_eq!(mismatch.expected, (4, 16, 16));
        assert_eq!(mismatch.found, (4, 16, 8));
    }

    #[test]
    fn test_out_of_range_channel_is_reported() {
        let mut row = row_with_membrane_seg();
        row.channel_brightfield = 9;
        let provider = FakeProvider::for_row(&row, (4, 16, 16));
        let err = build_combined(&build_recipe(&row), &provider).unwrap_err();
        let missing = err.downcast_ref::<MissingChannelError>().unwrap();
        assert_eq!(missing.requested, 9);
        assert_eq!(missing.available, 4);
    }

    #[test]
    fn test_select_channels_reorders_names_and_flags() -> Result<()> {
        let row = row_with_membrane_seg();
        let provider = FakeProvider::for_row(&row, (4, 16, 16));
        let (combined, _) = build_combined(&build_recipe(&row), &provider)?;
        let selected = combined.select_channels(&[3, 0, 2])?;
        assert_eq!(selected.channel_names, ["Bright", "Memb", "DNA"]);
        assert_eq!(selected.data.dim(), (3, 4, 16, 16));
        assert!(combined.select_channels(&[7]).is_err());
        Ok(())
    }
}
