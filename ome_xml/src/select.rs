//! Channel selection and z-window filtering over metadata documents.

use crate::document::{ChannelDef, DataDescriptor, MetadataDocument, PlaneDef};
use crate::MetadataError;

/// Retain only the channels at `ordered_indices`, in that order.
///
/// Channel ids are reassigned to the canonical sequential form, retained
/// planes are remapped to their new channel positions, and the data
/// descriptor is rebuilt to cover the new plane count.
pub fn select_channels(
    doc: &MetadataDocument,
    ordered_indices: &[usize],
) -> Result<MetadataDocument, MetadataError> {
    if let Some(&bad) = ordered_indices
        .iter()
        .find(|&&index| index >= doc.channels.len())
    {
        return Err(MetadataError::Invariant(format!(
            "channel index {bad} out of range for {} declared channels",
            doc.channels.len()
        )));
    }

    let channels = ordered_indices
        .iter()
        .enumerate()
        .map(|(new_index, &old_index)| ChannelDef {
            id: format!("Channel:0:{new_index}"),
            name: doc.channels[old_index].name.clone(),
        })
        .collect();
    let planes: Vec<PlaneDef> = doc
        .planes
        .iter()
        .filter_map(|plane| {
            ordered_indices
                .iter()
                .position(|&old_index| old_index == plane.channel_index)
                .map(|new_index| PlaneDef {
                    channel_index: new_index,
                    z_index: plane.z_index,
                    t_index: plane.t_index,
                })
        })
        .collect();

    let size_c = ordered_indices.len();
    let expected = size_c * doc.size_z * doc.size_t;
    if planes.len() != expected {
        return Err(MetadataError::Invariant(format!(
            "selecting {size_c} channels implies {expected} planes, found {}",
            planes.len()
        )));
    }
    Ok(MetadataDocument {
        size_c,
        channels,
        planes,
        data_descriptor: DataDescriptor::TiffData {
            plane_count: expected,
        },
        ..doc.clone()
    })
}

/// Retain only the planes inside the half-open z window `[zmin, zmax)` and
/// shift them to start at zero. Used after spatial cropping.
pub fn filter_z_window(
    doc: &MetadataDocument,
    zmin: usize,
    zmax: usize,
) -> Result<MetadataDocument, MetadataError> {
    if zmin > zmax || zmax > doc.size_z {
        return Err(MetadataError::Invariant(format!(
            "z window [{zmin}, {zmax}) does not fit a document with {} z slices",
            doc.size_z
        )));
    }
    let planes: Vec<PlaneDef> = doc
        .planes
        .iter()
        .filter(|plane| plane.z_index >= zmin && plane.z_index < zmax)
        .map(|plane| PlaneDef {
            z_index: plane.z_index - zmin,
            ..*plane
        })
        .collect();
    let size_z = zmax - zmin;
    Ok(MetadataDocument {
        size_z,
        planes,
        data_descriptor: DataDescriptor::TiffData {
            plane_count: doc.size_c * size_z * doc.size_t,
        },
        ..doc.clone()
    })
}
