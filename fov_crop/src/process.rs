//! Per-FOV orchestration: one full-field artifact, then one artifact per
//! segmented cell, in two strict phases with no intermediate state.
#![allow(missing_docs)]

use crate::combine::{build_combined, CombinedImage};
use crate::errors::UnsupportedDocumentError;
use crate::reader::ReaderProvider;
use crate::recipe::{build_recipe, channel_names};
use crate::row::FovRow;
use crate::sink::{ArtifactSink, ChannelRoles, FovArtifact, ThumbnailRenderer};
use anyhow::{bail, Context, Result};
use itertools::Itertools;
use ndarray::{Array4, Axis};
use ome_xml::{clean_known_issues, filter_z_window, select_channels, MetadataDocument};
use seg_mask::{compute_bounds, crop, to_mask, SegmentationBounds, DEFAULT_MARGIN};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

fn default_margin() -> usize {
    DEFAULT_MARGIN
}

fn default_mask_positive() -> u16 {
    1
}

fn default_cell_channel() -> String {
    channel_names::MEMBRANE_SEG.to_string()
}

/// Knobs for one FOV invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropConfig {
    /// padding around each cell's tight bounding box
    #[serde(default = "default_margin")]
    pub margin: usize,
    /// value written into binarized mask channels
    #[serde(default = "default_mask_positive")]
    pub mask_positive: u16,
    /// reduced channel set for the full-field artifact, as indices into
    /// the combined channel order; cells always carry the full set
    #[serde(default)]
    pub channel_subset: Option<Vec<usize>>,
    /// channel scanned for cell labels
    #[serde(default = "default_cell_channel")]
    pub cell_channel: String,
    /// edge length for rendered thumbnails; none disables rendering
    #[serde(default)]
    pub thumbnail_size: Option<usize>,
}

impl Default for CropConfig {
    fn default() -> Self {
        CropConfig {
            margin: DEFAULT_MARGIN,
            mask_positive: 1,
            channel_subset: None,
            cell_channel: default_cell_channel(),
            thumbnail_size: None,
        }
    }
}

/// One cropped cell, ready to become an artifact.
#[derive(Debug, Clone)]
pub struct CellRecord {
    pub label_index: u16,
    pub bounds: SegmentationBounds,
    pub image: Array4<u16>,
    pub metadata: MetadataDocument,
    pub generated_name: String,
}

/// Which labels of one FOV made it through.
#[derive(Debug, Clone, Serialize)]
pub struct FovSummary {
    pub fov_name: String,
    pub emitted: Vec<u16>,
    pub failed: Vec<(u16, String)>,
}

fn channel_roles(names: &[String]) -> Option<ChannelRoles> {
    let index_of = |name: &str| names.iter().position(|channel| channel == name);
    Some(ChannelRoles {
        membrane: index_of(channel_names::MEMBRANE)?,
        structure: index_of(channel_names::STRUCTURE)?,
        nucleus: index_of(channel_names::NUCLEUS)?,
        brightfield: index_of(channel_names::BRIGHTFIELD)?,
    })
}

fn descriptive_record(row: &FovRow) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("fov_id".to_string(), json!(row.fov_id));
    record.insert("fov_name".to_string(), json!(row.fov_name));
    record.insert(
        "pixel_size_xyz".to_string(),
        json!([row.pixel_size_x, row.pixel_size_y, row.pixel_size_z]),
    );
    if let Some(cell_line) = &row.cell_line {
        record.insert("cell_line".to_string(), json!(cell_line));
    }
    if let Some(well_name) = &row.well_name {
        record.insert("well_name".to_string(), json!(well_name));
    }
    record
}

fn render_summaries(
    renderer: Option<&dyn ThumbnailRenderer>,
    image: &Array4<u16>,
    roles: Option<ChannelRoles>,
    size: Option<usize>,
) -> Result<(Option<image::RgbImage>, Option<image::RgbImage>)> {
    let (Some(renderer), Some(roles), Some(size)) = (renderer, roles, size) else {
        return Ok((None, None));
    };
    let thumbnail = renderer.render_thumbnail(image, &roles, size)?;
    let atlas = renderer.render_atlas(image, &roles)?;
    Ok((Some(thumbnail), atlas))
}

/// Process one FOV: build the combined image, reconcile its metadata, emit
/// the full-field artifact, then crop/mask/emit every segmented cell.
///
/// Full-field failures abort the FOV before any per-cell work; a per-cell
/// failure costs only that cell and is reported in the summary.
pub fn process_fov(
    row: &FovRow,
    provider: &dyn ReaderProvider,
    sink: &mut dyn ArtifactSink,
    renderer: Option<&dyn ThumbnailRenderer>,
    config: &CropConfig,
) -> Result<FovSummary> {
    let recipe = build_recipe(row);
    let (combined, metadata_text) = build_combined(&recipe, provider)?;
    let metadata_text = metadata_text.ok_or_else(|| UnsupportedDocumentError {
        path: row.source_path.clone(),
    })?;

    let outcome = clean_known_issues(&metadata_text);
    for change in &outcome.changes {
        log::info!("{}: metadata cleanup: {change}", row.fov_name);
    }
    if !outcome.resolved {
        log::warn!(
            "{}: metadata data-descriptor ambiguity left for schema validation",
            row.fov_name
        );
    }
    let doc = MetadataDocument::from_xml(&outcome.text)?;

    // full-field phase
    let (field_image, field_doc) = match &config.channel_subset {
        Some(subset) => (
            combined.select_channels(subset)?,
            select_channels(&doc, subset)?,
        ),
        None => (combined.clone(), doc.clone()),
    };
    let (thumbnail, atlas) = render_summaries(
        renderer,
        &field_image.data,
        channel_roles(&field_image.channel_names),
        config.thumbnail_size,
    )?;
    sink.write(FovArtifact {
        name: row.fov_name.clone(),
        image: Some(field_image.data),
        thumbnail,
        atlas,
        metadata: field_doc,
        record: descriptive_record(row),
    })
    .context("writing the full-field artifact")?;

    // per-cell phase
    let Some(cell_channel) = combined.channel_index(&config.cell_channel) else {
        bail!(
            "cell segmentation channel '{}' is not part of the combined image",
            config.cell_channel
        );
    };
    let labels: Vec<u16> = combined
        .channel(cell_channel)
        .iter()
        .copied()
        .filter(|&value| value != 0)
        .sorted()
        .dedup()
        .collect();

    let roles = channel_roles(&combined.channel_names);
    let mut summary = FovSummary {
        fov_name: row.fov_name.clone(),
        emitted: Vec::new(),
        failed: Vec::new(),
    };
    for label in labels {
        let emitted = crop_cell(row, &combined, cell_channel, &doc, label, config)
            .and_then(|record| emit_cell(record, row, sink, renderer, roles, config));
        match emitted {
            Ok(()) => summary.emitted.push(label),
            Err(err) => {
                log::warn!("{}: cell {label} failed: {err:#}", row.fov_name);
                summary.failed.push((label, format!("{err:#}")));
            }
        }
    }
    log::info!(
        "{}: emitted {} cells, {} failed",
        row.fov_name,
        summary.emitted.len(),
        summary.failed.len()
    );
    Ok(summary)
}

/// Crop one label out of the combined image and derive its metadata.
fn crop_cell(
    row: &FovRow,
    combined: &CombinedImage,
    cell_channel: usize,
    doc: &MetadataDocument,
    label: u16,
    config: &CropConfig,
) -> Result<CellRecord> {
    let bounds = compute_bounds(combined.channel(cell_channel), label, config.margin)?;
    let mut image = crop(combined.data.view(), &bounds);
    for (channel, &maskable) in combined.mask_flags.iter().enumerate() {
        if maskable {
            let mask = to_mask(image.index_axis(Axis(0), channel), label, config.mask_positive);
            image.index_axis_mut(Axis(0), channel).assign(&mask);
        }
    }

    let mut metadata = doc.clone();
    metadata.size_x = bounds.x.len();
    metadata.size_y = bounds.y.len();
    let metadata = filter_z_window(&metadata, bounds.z.start, bounds.z.stop)?;

    Ok(CellRecord {
        label_index: label,
        bounds,
        image,
        metadata,
        generated_name: format!("{}_{label}", row.fov_name),
    })
}

fn emit_cell(
    record: CellRecord,
    row: &FovRow,
    sink: &mut dyn ArtifactSink,
    renderer: Option<&dyn ThumbnailRenderer>,
    roles: Option<ChannelRoles>,
    config: &CropConfig,
) -> Result<()> {
    let (thumbnail, atlas) =
        render_summaries(renderer, &record.image, roles, config.thumbnail_size)?;
    let mut cell_record = descriptive_record(row);
    cell_record.insert("cell_index".to_string(), json!(record.label_index));
    cell_record.insert("parent_fov".to_string(), json!(row.fov_name));
    cell_record.insert("bounds".to_string(), serde_json::to_value(record.bounds)?);
    sink.write(FovArtifact {
        name: record.generated_name,
        image: Some(record.image),
        thumbnail,
        atlas,
        metadata: record.metadata,
        record: cell_record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row_with_membrane_seg, CollectSink, FakeProvider};
    use image::RgbImage;
    use pretty_assertions::assert_eq;

    struct FlatRenderer;

    impl ThumbnailRenderer for FlatRenderer {
        fn render_thumbnail(
            &self,
            _image: &Array4<u16>,
            _roles: &ChannelRoles,
            size: usize,
        ) -> Result<RgbImage> {
            Ok(RgbImage::new(size as u32, size as u32))
        }
    }

    fn run(
        config: &CropConfig,
        mutate: impl FnOnce(&mut FakeProvider),
    ) -> (Result<FovSummary>, CollectSink) {
        let row = row_with_membrane_seg();
        let mut provider = FakeProvider::for_row(&row, (6, 16, 16));
        mutate(&mut provider);
        let mut sink = CollectSink::default();
        let summary = process_fov(&row, &provider, &mut sink, None, config);
        (summary, sink)
    }

    #[test]
    fn test_full_field_plus_one_artifact_per_cell() -> Result<()> {
        let config = CropConfig {
            margin: 1,
            ..CropConfig::default()
        };
        let (summary, sink) = run(&config, |_| {});
        let summary = summary?;
        assert_eq!(summary.emitted, [1, 2]);
        assert!(summary.failed.is_empty());
        assert_eq!(sink.artifacts.len(), 3);

        let field = &sink.artifacts[0];
        assert_eq!(field.name, "plate1_A1_17");
        assert_eq!(field.image.as_ref().unwrap().dim(), (5, 6, 16, 16));
        assert_eq!(field.metadata.size_c, 4);
        assert_eq!(field.metadata.size_z, 6);

        for (artifact, label) in sink.artifacts[1..].iter().zip([1u16, 2]) {
            assert_eq!(artifact.name, format!("plate1_A1_17_{label}"));
            let image = artifact.image.as_ref().unwrap();
            let (channels, size_z, size_y, size_x) = image.dim();
            assert_eq!(channels, 5);
            assert_eq!(artifact.metadata.size_z, size_z);
            assert_eq!(artifact.metadata.size_y, size_y);
            assert_eq!(artifact.metadata.size_x, size_x);
            assert_eq!(
                artifact.metadata.planes.len(),
                artifact.metadata.expected_plane_count()
            );
            // the membrane segmentation channel is binarized to this label
            let mask = image.index_axis(Axis(0), 4);
            assert!(mask.iter().all(|&value| value == 0 || value == 1));
            assert!(mask.iter().any(|&value| value == 1));
        }

        // label 1 occupies z 1..=2 with margin 1: z window [0,4)
        let cell_one = &sink.artifacts[1];
        assert_eq!(cell_one.metadata.size_z, 4);
        assert_eq!(cell_one.image.as_ref().unwrap().dim().1, 4);
        Ok(())
    }

    #[test]
    fn test_sink_refusal_costs_only_that_cell() {
        let row = row_with_membrane_seg();
        let provider = FakeProvider::for_row(&row, (6, 16, 16));
        let mut sink = CollectSink {
            fail_on: Some("plate1_A1_17_1".to_string()),
            ..CollectSink::default()
        };
        let summary =
            process_fov(&row, &provider, &mut sink, None, &CropConfig::default()).unwrap();
        assert_eq!(summary.emitted, [2]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, 1);
        assert_eq!(sink.artifacts.len(), 2);
    }

    #[test]
    fn test_missing_metadata_document_is_fatal() {
        let row = row_with_membrane_seg();
        let (result, sink) = run(&CropConfig::default(), |provider| {
            provider.drop_metadata(&row.source_path);
        });
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<UnsupportedDocumentError>().is_some());
        assert!(sink.artifacts.is_empty());
    }

    #[test]
    fn test_channel_subset_applies_to_full_field_only() -> Result<()> {
        let config = CropConfig {
            channel_subset: Some(vec![3, 0, 2]),
            ..CropConfig::default()
        };
        let (summary, sink) = run(&config, |_| {});
        summary?;
        let field = &sink.artifacts[0];
        assert_eq!(field.metadata.size_c, 3);
        assert_eq!(field.image.as_ref().unwrap().dim().0, 3);
        let names: Vec<_> = field
            .metadata
            .channels
            .iter()
            .map(|channel| channel.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, ["Bright", "Memb", "DNA"]);
        // cells still carry the complete channel set and metadata
        assert_eq!(sink.artifacts[1].metadata.size_c, 4);
        assert_eq!(sink.artifacts[1].image.as_ref().unwrap().dim().0, 5);
        Ok(())
    }

    #[test]
    fn test_unknown_cell_channel_is_fatal() {
        let config = CropConfig {
            cell_channel: "Seg_DNA".to_string(),
            ..CropConfig::default()
        };
        let (result, sink) = run(&config, |_| {});
        assert!(result.is_err());
        // the full-field artifact had already been emitted when the
        // per-cell phase refused to start
        assert_eq!(sink.artifacts.len(), 1);
    }

    #[test]
    fn test_thumbnails_attached_when_configured() -> Result<()> {
        let row = row_with_membrane_seg();
        let provider = FakeProvider::for_row(&row, (6, 16, 16));
        let mut sink = CollectSink::default();
        let config = CropConfig {
            thumbnail_size: Some(32),
            ..CropConfig::default()
        };
        process_fov(&row, &provider, &mut sink, Some(&FlatRenderer), &config)?;
        assert!(sink
            .artifacts
            .iter()
            .all(|artifact| artifact.thumbnail.is_some()));
        assert!(sink.artifacts[0].thumbnail.as_ref().unwrap().width() == 32);
        Ok(())
    }
}
