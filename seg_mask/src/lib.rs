//!
//! Bounding boxes and binary masks for labeled segmentation volumes.
//!
//! Label volumes are stored (Z,Y,X). Bounds are reported per named axis as
//! half-open intervals so callers cannot conflate the storage order with the
//! reporting order.
//!
#![allow(missing_docs)]

use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Default padding added around a label's tight bounding box before clamping.
pub const DEFAULT_MARGIN: usize = 5;

/// A label index with no voxels in the scanned volume.
#[derive(Debug, Error)]
#[error("label {label} has no voxels in a {shape:?} (Z,Y,X) volume")]
pub struct LabelNotFoundError {
    pub label: String,
    pub shape: (usize, usize, usize),
}

/// Half-open interval along one spatial axis.
/// Invariant after clamping: `0 <= start <= stop <= axis size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisBounds {
    pub start: usize,
    pub stop: usize,
}

impl AxisBounds {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }
}

/// Clamped per-axis bounds of one labeled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationBounds {
    pub x: AxisBounds,
    pub y: AxisBounds,
    pub z: AxisBounds,
}

impl SegmentationBounds {
    /// Cropped extent in storage order.
    pub fn shape_zyx(&self) -> (usize, usize, usize) {
        (self.z.len(), self.y.len(), self.x.len())
    }
}

fn expand_and_clamp(min: usize, max: usize, margin: usize, size: usize) -> AxisBounds {
    AxisBounds {
        start: min.saturating_sub(margin),
        stop: (max + 1 + margin).min(size),
    }
}

/// Locate every voxel equal to `label_index` and return its bounding box,
/// expanded outward by `margin` on both ends of every axis and clamped to the
/// volume extent.
pub fn compute_bounds<T>(
    label_plane: ArrayView3<'_, T>,
    label_index: T,
    margin: usize,
) -> Result<SegmentationBounds, LabelNotFoundError>
where
    T: Copy + PartialEq + Display,
{
    let (size_z, size_y, size_x) = label_plane.dim();
    let mut extent: Option<[(usize, usize); 3]> = None;
    for ((z, y, x), &value) in label_plane.indexed_iter() {
        if value != label_index {
            continue;
        }
        match extent.as_mut() {
            None => extent = Some([(z, z), (y, y), (x, x)]),
            Some([zext, yext, xext]) => {
                zext.0 = zext.0.min(z);
                zext.1 = zext.1.max(z);
                yext.0 = yext.0.min(y);
                yext.1 = yext.1.max(y);
                xext.0 = xext.0.min(x);
                xext.1 = xext.1.max(x);
            }
        }
    }
    let Some([zext, yext, xext]) = extent else {
        return Err(LabelNotFoundError {
            label: label_index.to_string(),
            shape: (size_z, size_y, size_x),
        });
    };
    Ok(SegmentationBounds {
        x: expand_and_clamp(xext.0, xext.1, margin, size_x),
        y: expand_and_clamp(yext.0, yext.1, margin, size_y),
        z: expand_and_clamp(zext.0, zext.1, margin, size_z),
    })
}

/// Binarize a label volume: `positive_value` where the voxel equals
/// `label_index`, zero elsewhere. The element type is preserved.
pub fn to_mask<T>(plane: ArrayView3<'_, T>, label_index: T, positive_value: T) -> Array3<T>
where
    T: Copy + PartialEq + Zero,
{
    plane.map(|&value| {
        if value == label_index {
            positive_value
        } else {
            T::zero()
        }
    })
}

/// Crop the spatial axes of a (C,Z,Y,X) image to `bounds`, leaving the
/// channel axis untouched. Always returns an owned copy so the source stays
/// usable for further crops.
pub fn crop<T: Copy>(image: ArrayView4<'_, T>, bounds: &SegmentationBounds) -> Array4<T> {
    image
        .slice(s![
            ..,
            bounds.z.start..bounds.z.stop,
            bounds.y.start..bounds.y.stop,
            bounds.x.start..bounds.x.stop
        ])
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn plane_with_block() -> Array3<u16> {
        // label 5 occupies z in [2,4], y in [3,5], x in [1,2] inclusive
        let mut plane = Array3::<u16>::zeros((10, 10, 10));
        for z in 2..=4 {
            for y in 3..=5 {
                for x in 1..=2 {
                    plane[[z, y, x]] = 5;
                }
            }
        }
        plane
    }

    #[test]
    fn test_bounds_with_margin() {
        let plane = plane_with_block();
        let bounds = compute_bounds(plane.view(), 5, 1).unwrap();
        assert_eq!(bounds.x, AxisBounds { start: 0, stop: 4 });
        assert_eq!(bounds.y, AxisBounds { start: 2, stop: 7 });
        assert_eq!(bounds.z, AxisBounds { start: 1, stop: 6 });
    }

    #[test]
    fn test_bounds_clamp_to_volume() {
        let plane = plane_with_block();
        let bounds = compute_bounds(plane.view(), 5, 100).unwrap();
        assert_eq!(bounds.x, AxisBounds { start: 0, stop: 10 });
        assert_eq!(bounds.y, AxisBounds { start: 0, stop: 10 });
        assert_eq!(bounds.z, AxisBounds { start: 0, stop: 10 });
    }

    #[test]
    fn test_missing_label() {
        let plane = plane_with_block();
        let err = compute_bounds(plane.view(), 9, 0).unwrap_err();
        assert_eq!(err.label, "9");
        assert_eq!(err.shape, (10, 10, 10));
    }

    #[test]
    fn test_mask_is_idempotent() {
        let plane = plane_with_block();
        let once = to_mask(plane.view(), 5, 1);
        let twice = to_mask(once.view(), 1, 1);
        assert_eq!(once, twice);
        assert!(once.iter().all(|&v| v == 0 || v == 1));
    }

    #[test]
    fn test_mask_preserves_positive_value() {
        let plane = plane_with_block();
        let mask = to_mask(plane.view(), 5, 255);
        assert_eq!(mask[[3, 4, 1]], 255);
        assert_eq!(mask[[0, 0, 0]], 0);
    }

    #[test]
    fn test_crop_is_an_owned_copy() {
        let mut image = Array4::<u16>::zeros((2, 10, 10, 10));
        image[[1, 3, 4, 2]] = 42;
        let bounds = SegmentationBounds {
            x: AxisBounds { start: 1, stop: 4 },
            y: AxisBounds { start: 2, stop: 7 },
            z: AxisBounds { start: 1, stop: 6 },
        };
        let cropped = crop(image.view(), &bounds);
        assert_eq!(cropped.dim(), (2, 5, 5, 3));
        assert_eq!(cropped[[1, 2, 2, 1]], 42);
        // the source must remain usable for sibling crops
        let again = crop(image.view(), &bounds);
        assert_eq!(cropped, again);
    }

    proptest! {
        #[test]
        fn bounds_always_inside_volume(
            z in 0usize..10,
            y in 0usize..10,
            x in 0usize..10,
            margin in 0usize..25,
        ) {
            let mut plane = Array3::<u16>::zeros((10, 10, 10));
            plane[[z, y, x]] = 7;
            let bounds = compute_bounds(plane.view(), 7, margin).unwrap();
            for axis in [bounds.x, bounds.y, bounds.z] {
                prop_assert!(axis.start <= axis.stop);
                prop_assert!(axis.stop <= 10);
            }
        }
    }
}
