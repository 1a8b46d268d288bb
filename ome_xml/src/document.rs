//! Typed value model of the structured metadata document.

use crate::xml_tree::{find_first, local, malformed, parse_tree, Element};
use crate::{MetadataError, SCHEMA_NAMESPACE};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use serde::Serialize;
use std::str::FromStr;

/// One declared channel of the pixel data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDef {
    pub id: String,
    pub name: Option<String>,
}

/// One declared (channel, z, t) slice of the pixel data. Distinct from a
/// label plane: this is a descriptor, not a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaneDef {
    pub channel_index: usize,
    pub z_index: usize,
    pub t_index: usize,
}

/// The single element describing where the pixel payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataDescriptor {
    BinData,
    TiffData { plane_count: usize },
    MetadataOnly,
}

/// An immutable structured metadata document. Transformations live in
/// [`crate::select_channels`] and [`crate::filter_z_window`] and always
/// return new values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataDocument {
    pub image_id: String,
    pub image_name: Option<String>,
    pub dimension_order: String,
    pub pixel_type: String,
    pub size_c: usize,
    pub size_t: usize,
    pub size_x: usize,
    pub size_y: usize,
    pub size_z: usize,
    pub physical_size_x: Option<f64>,
    pub physical_size_y: Option<f64>,
    pub physical_size_z: Option<f64>,
    pub channels: Vec<ChannelDef>,
    pub planes: Vec<PlaneDef>,
    pub data_descriptor: DataDescriptor,
}

fn required_attr<T: FromStr>(el: &Element, name: &str) -> Result<T, MetadataError> {
    let value = el.attr(name).ok_or_else(|| {
        MetadataError::Unsupported(format!("pixel-data block lacks a {name} attribute"))
    })?;
    value
        .parse()
        .map_err(|_| MetadataError::Unsupported(format!("{name} attribute '{value}' is not valid")))
}

fn optional_attr<T: FromStr>(el: &Element, name: &str) -> Result<Option<T>, MetadataError> {
    el.attr(name)
        .map(|value| {
            value.parse().map_err(|_| {
                MetadataError::Unsupported(format!("{name} attribute '{value}' is not valid"))
            })
        })
        .transpose()
}

impl MetadataDocument {
    /// Plane count implied by the declared dimension sizes.
    pub fn expected_plane_count(&self) -> usize {
        self.size_c * self.size_z * self.size_t
    }

    /// Parse a document from its XML text.
    pub fn from_xml(text: &str) -> Result<Self, MetadataError> {
        let root = parse_tree(text)?;
        let image = find_first(&root, "Image")
            .ok_or_else(|| MetadataError::Unsupported("document has no image element".into()))?;
        let pixels = find_first(image, "Pixels")
            .ok_or_else(|| MetadataError::Unsupported("image has no pixel-data block".into()))?;

        let mut channels = Vec::new();
        let mut planes = Vec::new();
        let mut descriptor = None;
        let mut tiff_elements = 0usize;
        let mut tiff_plane_count = None;
        for child in pixels.child_elements() {
            match local(&child.name) {
                "Channel" => {
                    let index = channels.len();
                    channels.push(ChannelDef {
                        id: child
                            .attr("ID")
                            .map_or_else(|| format!("Channel:0:{index}"), String::from),
                        name: child.attr("Name").map(String::from),
                    });
                }
                "Plane" => planes.push(PlaneDef {
                    channel_index: required_attr(child, "TheC")?,
                    z_index: required_attr(child, "TheZ")?,
                    t_index: optional_attr(child, "TheT")?.unwrap_or(0),
                }),
                "BinData" => {
                    descriptor.get_or_insert(DataDescriptor::BinData);
                }
                "MetadataOnly" => {
                    descriptor.get_or_insert(DataDescriptor::MetadataOnly);
                }
                "TiffData" => {
                    tiff_elements += 1;
                    if tiff_plane_count.is_none() {
                        tiff_plane_count = optional_attr(child, "PlaneCount")?;
                    }
                    descriptor.get_or_insert(DataDescriptor::TiffData { plane_count: 0 });
                }
                _ => {}
            }
        }
        // schema validation of descriptor multiplicity is a downstream
        // concern; the first descriptor encountered wins here
        let data_descriptor = match descriptor {
            Some(DataDescriptor::TiffData { .. }) => DataDescriptor::TiffData {
                plane_count: tiff_plane_count.unwrap_or(tiff_elements),
            },
            Some(other) => other,
            None => DataDescriptor::MetadataOnly,
        };

        let doc = MetadataDocument {
            image_id: image.attr("ID").unwrap_or("Image:0").to_string(),
            image_name: image.attr("Name").map(String::from),
            dimension_order: pixels.attr("DimensionOrder").unwrap_or("XYZCT").to_string(),
            pixel_type: pixels.attr("Type").unwrap_or("uint16").to_string(),
            size_c: required_attr(pixels, "SizeC")?,
            size_t: required_attr(pixels, "SizeT")?,
            size_x: required_attr(pixels, "SizeX")?,
            size_y: required_attr(pixels, "SizeY")?,
            size_z: required_attr(pixels, "SizeZ")?,
            physical_size_x: optional_attr(pixels, "PhysicalSizeX")?,
            physical_size_y: optional_attr(pixels, "PhysicalSizeY")?,
            physical_size_z: optional_attr(pixels, "PhysicalSizeZ")?,
            channels,
            planes,
            data_descriptor,
        };
        if let Some(plane) = doc
            .planes
            .iter()
            .find(|plane| plane.channel_index >= doc.channels.len())
        {
            return Err(MetadataError::Invariant(format!(
                "plane references channel {} but only {} channels are declared",
                plane.channel_index,
                doc.channels.len()
            )));
        }
        Ok(doc)
    }

    /// Serialize the document back to canonical XML text.
    pub fn to_xml(&self) -> Result<String, MetadataError> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(malformed)?;

        let mut ome = BytesStart::new("OME");
        ome.push_attribute(("xmlns", SCHEMA_NAMESPACE));
        writer.write_event(Event::Start(ome)).map_err(malformed)?;

        let mut image = BytesStart::new("Image");
        image.push_attribute(("ID", self.image_id.as_str()));
        if let Some(name) = &self.image_name {
            image.push_attribute(("Name", name.as_str()));
        }
        writer.write_event(Event::Start(image)).map_err(malformed)?;

        let mut pixels = BytesStart::new("Pixels");
        pixels.push_attribute(("ID", "Pixels:0"));
        pixels.push_attribute(("DimensionOrder", self.dimension_order.as_str()));
        pixels.push_attribute(("Type", self.pixel_type.as_str()));
        pixels.push_attribute(("SizeC", self.size_c.to_string().as_str()));
        pixels.push_attribute(("SizeT", self.size_t.to_string().as_str()));
        pixels.push_attribute(("SizeX", self.size_x.to_string().as_str()));
        pixels.push_attribute(("SizeY", self.size_y.to_string().as_str()));
        pixels.push_attribute(("SizeZ", self.size_z.to_string().as_str()));
        for (name, value) in [
            ("PhysicalSizeX", self.physical_size_x),
            ("PhysicalSizeY", self.physical_size_y),
            ("PhysicalSizeZ", self.physical_size_z),
        ] {
            if let Some(value) = value {
                pixels.push_attribute((name, value.to_string().as_str()));
            }
        }
        writer.write_event(Event::Start(pixels)).map_err(malformed)?;

        for channel in &self.channels {
            let mut el = BytesStart::new("Channel");
            el.push_attribute(("ID", channel.id.as_str()));
            if let Some(name) = &channel.name {
                el.push_attribute(("Name", name.as_str()));
            }
            writer.write_event(Event::Empty(el)).map_err(malformed)?;
        }

        match self.data_descriptor {
            DataDescriptor::BinData => {
                writer
                    .write_event(Event::Empty(BytesStart::new("BinData")))
                    .map_err(malformed)?;
            }
            DataDescriptor::TiffData { plane_count } => {
                let mut el = BytesStart::new("TiffData");
                el.push_attribute(("PlaneCount", plane_count.to_string().as_str()));
                writer.write_event(Event::Empty(el)).map_err(malformed)?;
            }
            DataDescriptor::MetadataOnly => {
                writer
                    .write_event(Event::Empty(BytesStart::new("MetadataOnly")))
                    .map_err(malformed)?;
            }
        }

        for plane in &self.planes {
            let mut el = BytesStart::new("Plane");
            el.push_attribute(("TheC", plane.channel_index.to_string().as_str()));
            el.push_attribute(("TheT", plane.t_index.to_string().as_str()));
            el.push_attribute(("TheZ", plane.z_index.to_string().as_str()));
            writer.write_event(Event::Empty(el)).map_err(malformed)?;
        }

        for name in ["Pixels", "Image", "OME"] {
            writer
                .write_event(Event::End(BytesEnd::new(name)))
                .map_err(malformed)?;
        }
        String::from_utf8(writer.into_inner()).map_err(malformed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Four raw channels, ten z slices, one timepoint; plane list complete.
    pub(crate) fn four_channel_doc() -> MetadataDocument {
        let names = ["Memb", "Struct", "DNA", "Bright"];
        MetadataDocument {
            image_id: "Image:0".to_string(),
            image_name: Some("fov_test".to_string()),
            dimension_order: "XYZCT".to_string(),
            pixel_type: "uint16".to_string(),
            size_c: 4,
            size_t: 1,
            size_x: 64,
            size_y: 48,
            size_z: 10,
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
                .flat_map(|c| {
                    (0..10).map(move |z| PlaneDef {
                        channel_index: c,
                        z_index: z,
                        t_index: 0,
                    })
                })
                .collect(),
            data_descriptor: DataDescriptor::TiffData { plane_count: 40 },
        }
    }

    #[test]
    fn test_xml_roundtrip() -> Result<(), MetadataError> {
        let doc = four_channel_doc();
        let text = doc.to_xml()?;
        let reparsed = MetadataDocument::from_xml(&text)?;
        assert_eq!(doc, reparsed);
        Ok(())
    }

    #[test]
    fn test_plane_referencing_missing_channel_is_rejected() {
        let text = r#"<OME><Image ID="Image:0"><Pixels SizeC="1" SizeT="1" SizeX="4" SizeY="4" SizeZ="1">
            <Channel ID="Channel:0:0"/><TiffData PlaneCount="1"/>
            <Plane TheC="3" TheZ="0" TheT="0"/>
        </Pixels></Image></OME>"#;
        let err = MetadataDocument::from_xml(text).unwrap_err();
        assert!(matches!(err, MetadataError::Invariant(_)));
    }

    #[test]
    fn test_document_without_image_is_unsupported() {
        let err = MetadataDocument::from_xml("<OME></OME>").unwrap_err();
        assert!(matches!(err, MetadataError::Unsupported(_)));
    }

    #[test]
    fn test_tiff_elements_counted_without_plane_count_attr() -> Result<(), MetadataError> {
        let text = r#"<OME><Image ID="Image:0"><Pixels SizeC="1" SizeT="1" SizeX="4" SizeY="4" SizeZ="2">
            <Channel ID="Channel:0:0"/><TiffData/><TiffData/>
        </Pixels></Image></OME>"#;
        let doc = MetadataDocument::from_xml(text)?;
        assert_eq!(
            doc.data_descriptor,
            DataDescriptor::TiffData { plane_count: 2 }
        );
        Ok(())
    }
}
