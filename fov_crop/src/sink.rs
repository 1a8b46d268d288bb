//! Output-side collaborator contracts: finished artifacts, the persistence
//! sink, and summary-image rendering.
#![allow(missing_docs)]

use anyhow::Result;
use image::RgbImage;
use ndarray::Array4;
use ome_xml::MetadataDocument;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role-to-channel-index mapping into the combined image, handed to
/// thumbnail rendering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelRoles {
    pub membrane: usize,
    pub structure: usize,
    pub nucleus: usize,
    pub brightfield: usize,
}

/// A finished artifact. The core only ever hands complete artifacts to the
/// sink; it never opens output files itself.
#[derive(Debug, Clone)]
pub struct FovArtifact {
    pub name: String,
    pub image: Option<Array4<u16>>,
    pub thumbnail: Option<RgbImage>,
    pub atlas: Option<RgbImage>,
    pub metadata: MetadataDocument,
    /// descriptive key-value record for the catalog
    pub record: Map<String, Value>,
}

/// Persistence collaborator.
pub trait ArtifactSink {
    fn write(&mut self, artifact: FovArtifact) -> Result<()>;
}

/// Rendering collaborator for summary imagery. Pixel correctness is its
/// own concern; the core only guarantees the channel-index contract.
pub trait ThumbnailRenderer {
    fn render_thumbnail(
        &self,
        image: &Array4<u16>,
        roles: &ChannelRoles,
        size: usize,
    ) -> Result<RgbImage>;

    fn render_atlas(&self, image: &Array4<u16>, roles: &ChannelRoles) -> Result<Option<RgbImage>> {
        let _ = (image, roles);
        Ok(None)
    }
}
