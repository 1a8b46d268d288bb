//! In-memory fakes so the core can be exercised without any real files.

use crate::errors::MissingChannelError;
use crate::reader::{ReaderProvider, VolumeReader};
use crate::row::{FovRow, SegSource};
use crate::sink::{ArtifactSink, FovArtifact};
use anyhow::{bail, Result};
use ndarray::Array3;
use ome_xml::{ChannelDef, DataDescriptor, MetadataDocument, PlaneDef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub(crate) fn row_with_membrane_seg() -> FovRow {
    FovRow {
        fov_id: 17,
        fov_name: "plate1_A1_17".to_string(),
        source_path: PathBuf::from("/data/plate1/fov17.ome.tiff"),
        channel_membrane: 0,
        channel_structure: 1,
        channel_nucleus: 2,
        channel_brightfield: 3,
        nucleus_segmentation: None,
        membrane_segmentation: Some(SegSource {
            path: PathBuf::from("/data/seg/fov17_memb.tiff"),
            channel: 0,
        }),
        structure_segmentation: None,
        membrane_contour: None,
        pixel_size_x: 0.108,
        pixel_size_y: 0.108,
        pixel_size_z: 0.29,
        cell_line: Some("line_13".to_string()),
        well_name: Some("A1".to_string()),
    }
}

/// Four raw channels over the given (Z,Y,X) extent, plane list complete.
pub(crate) fn metadata_for(shape_zyx: (usize, usize, usize)) -> MetadataDocument {
    let (size_z, size_y, size_x) = shape_zyx;
    let names = ["Memb", "Struct", "DNA", "Bright"];
    MetadataDocument {
        image_id: "Image:0".to_string(),
        image_name: Some("plate1_A1_17".to_string()),
        dimension_order: "XYZCT".to_string(),
        pixel_type: "uint16".to_string(),
        size_c: 4,
        size_t: 1,
        size_x,
        size_y,
        size_z,
        physical_size_x: Some(0.108),
        physical_size_y: Some(0.108),
        physical_size_z: Some(0.29),
        channels: names
            .iter()
            .enumerate()
            .map(|(index, name)| ChannelDef {
                id: format!("Channel:0:{index}"),
                name: Some((*name).to_string()),
            })
            .collect(),
        planes: (0..4)
            .flat_map(|channel_index| {
                (0..size_z).map(move |z_index| PlaneDef {
                    channel_index,
                    z_index,
                    t_index: 0,
                })
            })
            .collect(),
        data_descriptor: DataDescriptor::TiffData {
            plane_count: 4 * size_z,
        },
    }
}

/// Labels 1 and 2 as separated blocks, zero elsewhere. Needs at least a
/// (4,16,16) volume.
pub(crate) fn two_label_volume(shape_zyx: (usize, usize, usize)) -> Array3<u16> {
    let mut volume = Array3::<u16>::zeros(shape_zyx);
    for z in 1..3 {
        for y in 2..5 {
            for x in 2..5 {
                volume[[z, y, x]] = 1;
            }
        }
    }
    for z in 1..4 {
        for y in 8..12 {
            for x in 8..13 {
                volume[[z, y, x]] = 2;
            }
        }
    }
    volume
}

pub(crate) struct FakeSource {
    pub volumes: Vec<Array3<u16>>,
    pub metadata_text: Option<String>,
}

pub(crate) struct FakeProvider {
    pub sources: HashMap<PathBuf, FakeSource>,
}

impl FakeProvider {
    /// Primary with four ramp channels, plus a two-label volume for every
    /// segmentation source the row carries.
    pub fn for_row(row: &FovRow, shape_zyx: (usize, usize, usize)) -> Self {
        let volumes: Vec<Array3<u16>> = (0..4)
            .map(|channel| {
                Array3::from_shape_fn(shape_zyx, move |(z, y, x)| {
                    (channel * 1000 + z * 100 + y * 10 + x) as u16
                })
            })
            .collect();
        let metadata_text = metadata_for(shape_zyx)
            .to_xml()
            .expect("test metadata serializes");
        let mut sources = HashMap::new();
        sources.insert(
            row.source_path.clone(),
            FakeSource {
                volumes,
                metadata_text: Some(metadata_text),
            },
        );
        for seg in [
            &row.nucleus_segmentation,
            &row.membrane_segmentation,
            &row.structure_segmentation,
            &row.membrane_contour,
        ]
        .into_iter()
        .flatten()
        {
            if seg.is_present() {
                sources.insert(
                    seg.path.clone(),
                    FakeSource {
                        volumes: vec![two_label_volume(shape_zyx)],
                        metadata_text: None,
                    },
                );
            }
        }
        FakeProvider { sources }
    }

    pub fn replace_volume(&mut self, path: PathBuf, volume: Array3<u16>) {
        self.sources.insert(
            path,
            FakeSource {
                volumes: vec![volume],
                metadata_text: None,
            },
        );
    }

    pub fn drop_metadata(&mut self, path: &Path) {
        if let Some(source) = self.sources.get_mut(path) {
            source.metadata_text = None;
        }
    }
}

struct FakeReader {
    path: PathBuf,
    volumes: Vec<Array3<u16>>,
    metadata_text: Option<String>,
}

impl VolumeReader for FakeReader {
    fn channel_count(&self) -> usize {
        self.volumes.len()
    }

    fn read_channel(&mut self, channel: usize) -> Result<Array3<u16>> {
        self.volumes.get(channel).cloned().ok_or_else(|| {
            MissingChannelError {
                path: self.path.clone(),
                requested: channel,
                available: self.volumes.len(),
            }
            .into()
        })
    }

    fn metadata_text(&self) -> Option<&str> {
        self.metadata_text.as_deref()
    }
}

impl ReaderProvider for FakeProvider {
    fn open(&self, path: &Path) -> Result<Box<dyn VolumeReader>> {
        let Some(source) = self.sources.get(path) else {
            bail!("no fake source registered for {path:?}");
        };
        Ok(Box::new(FakeReader {
            path: path.to_path_buf(),
            volumes: source.volumes.clone(),
            metadata_text: source.metadata_text.clone(),
        }))
    }
}

/// Collects artifacts in memory; can refuse one by name to exercise the
/// per-cell failure path.
#[derive(Default)]
pub(crate) struct CollectSink {
    pub artifacts: Vec<FovArtifact>,
    pub fail_on: Option<String>,
}

impl ArtifactSink for CollectSink {
    fn write(&mut self, artifact: FovArtifact) -> Result<()> {
        if self.fail_on.as_deref() == Some(artifact.name.as_str()) {
            bail!("sink refused '{}'", artifact.name);
        }
        self.artifacts.push(artifact);
        Ok(())
    }
}
