//! Source-side collaborator contract, plus TIFF and NPY backed readers.
#![allow(missing_docs)]

use crate::errors::MissingChannelError;
use anyhow::{bail, Context, Result};
use ndarray::{stack, Array2, Array3, Axis};
use ndarray_npy::ReadNpyExt;
use ome_xml::MetadataDocument;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

/// Random access to the (Z,Y,X) channel volumes of one source image.
pub trait VolumeReader {
    fn channel_count(&self) -> usize;

    /// 3-D (Z,Y,X) volume of one channel.
    fn read_channel(&mut self, channel: usize) -> Result<Array3<u16>>;

    /// Raw structured-metadata text; present on the primary acquisition only.
    fn metadata_text(&self) -> Option<&str> {
        None
    }
}

/// Opens a reader for a source descriptor. Injected so the core can be
/// exercised without any real files.
pub trait ReaderProvider {
    fn open(&self, path: &Path) -> Result<Box<dyn VolumeReader>>;
}

/// Page order of a multi-page TIFF holding a (C,Z) stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageOrder {
    /// all z slices of channel 0, then all of channel 1, ...
    #[default]
    ChannelMajor,
    /// one page per channel for each z slice in turn
    Interleaved,
}

/// Multi-page TIFF volume. Channel count comes from the embedded metadata
/// document when one is present, else the stack is a single channel.
pub struct TiffVolumeReader {
    path: PathBuf,
    pages: Vec<Array2<u16>>,
    channels: usize,
    order: PageOrder,
    metadata_text: Option<String>,
}

impl TiffVolumeReader {
    pub fn open(path: &Path, order: PageOrder) -> Result<Self> {
        let mut decoder = Decoder::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {path:?}"))?,
        ))?
        .with_limits(Limits::unlimited());
        let metadata_text = decoder
            .get_tag_ascii_string(Tag::ImageDescription)
            .ok()
            .filter(|text| !text.trim().is_empty());

        let mut pages = Vec::new();
        loop {
            let dims = decoder.dimensions()?;
            let shape = (dims.1 as usize, dims.0 as usize);
            let page = match decoder.read_image()? {
                DecodingResult::U16(data) => Array2::from_shape_vec(shape, data)?,
                DecodingResult::U8(data) => {
                    Array2::from_shape_vec(shape, data.into_iter().map(u16::from).collect())?
                }
                _ => bail!("{path:?}: only uint8 and uint16 TIFF pages are supported"),
            };
            pages.push(page);
            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
        }

        let channels = metadata_text
            .as_deref()
            .and_then(|text| MetadataDocument::from_xml(text).ok())
            .map_or(1, |doc| doc.size_c);
        if channels == 0 || pages.len() % channels != 0 {
            bail!(
                "{path:?}: {} pages cannot hold {channels} equally sized channels",
                pages.len()
            );
        }
        Ok(TiffVolumeReader {
            path: path.to_path_buf(),
            pages,
            channels,
            order,
            metadata_text,
        })
    }
}

impl VolumeReader for TiffVolumeReader {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn read_channel(&mut self, channel: usize) -> Result<Array3<u16>> {
        if channel >= self.channels {
            return Err(MissingChannelError {
                path: self.path.clone(),
                requested: channel,
                available: self.channels,
            }
            .into());
        }
        let size_z = self.pages.len() / self.channels;
        let views: Vec<_> = (0..size_z)
            .map(|z| {
                let page = match self.order {
                    PageOrder::ChannelMajor => channel * size_z + z,
                    PageOrder::Interleaved => z * self.channels + channel,
                };
                self.pages[page].view()
            })
            .collect();
        Ok(stack(Axis(0), &views)?)
    }

    fn metadata_text(&self) -> Option<&str> {
        self.metadata_text.as_deref()
    }
}

/// Single-channel NPY volume, as produced by upstream segmentation tools.
pub struct NpyVolumeReader {
    path: PathBuf,
    volume: Array3<u16>,
}

impl NpyVolumeReader {
    pub fn open(path: &Path) -> Result<Self> {
        let volume = Array3::<u16>::read_npy(
            File::open(path).with_context(|| format!("opening {path:?}"))?,
        )?;
        Ok(NpyVolumeReader {
            path: path.to_path_buf(),
            volume,
        })
    }
}

impl VolumeReader for NpyVolumeReader {
    fn channel_count(&self) -> usize {
        1
    }

    fn read_channel(&mut self, channel: usize) -> Result<Array3<u16>> {
        if channel != 0 {
            return Err(MissingChannelError {
                path: self.path.clone(),
                requested: channel,
                available: 1,
            }
            .into());
        }
        Ok(self.volume.clone())
    }
}

/// Filesystem-backed provider choosing a reader by file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReaderProvider {
    pub page_order: PageOrder,
}

impl ReaderProvider for FsReaderProvider {
    fn open(&self, path: &Path) -> Result<Box<dyn VolumeReader>> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match extension.as_str() {
            "npy" => Ok(Box::new(NpyVolumeReader::open(path)?)),
            "tif" | "tiff" => Ok(Box::new(TiffVolumeReader::open(path, self.page_order)?)),
            _ => bail!("{path:?}: unsupported source image format"),
        }
    }
}
