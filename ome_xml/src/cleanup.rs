//! Cleanup of metadata documents produced by historically buggy writers.
//!
//! Applied once to freshly parsed full-field metadata, before any channel
//! selection. Operates on a generic element tree because legacy documents
//! carry vendor content the typed model does not represent.

use crate::xml_tree::{for_each_element_mut, local, parse_tree, write_tree, Element, Node};
use crate::SCHEMA_NAMESPACE;

/// Namespaces emitted by older writers that downstream validators reject.
const KNOWN_INVALID_NAMESPACES: [&str; 2] = [
    "http://www.openmicroscopy.org/Schemas/ome/2013-06",
    "http://www.openmicroscopy.org/Schemas/OME/2013-06",
];

/// Annotation namespace one converter used to dump raw instrument metadata;
/// stripped together with every reference to it.
const VENDOR_ANNOTATION_NAMESPACE: &str = "openmicroscopy.org/OriginalMetadata";

/// Result of a cleanup pass.
///
/// When `resolved` is false the data-descriptor invariant could not be
/// repaired without guessing; the text is returned unchanged and the
/// decision is deferred to downstream schema validation.
#[derive(Debug, Clone)]
pub struct CleanupOutcome {
    pub text: String,
    pub changes: Vec<String>,
    pub resolved: bool,
}

fn unresolved(doc_text: &str) -> CleanupOutcome {
    CleanupOutcome {
        text: doc_text.to_string(),
        changes: Vec::new(),
        resolved: false,
    }
}

/// Repair the known defects of legacy metadata documents.
///
/// Idempotent: applying it to its own output yields byte-identical text and
/// zero reported changes.
pub fn clean_known_issues(doc_text: &str) -> CleanupOutcome {
    let mut changes = Vec::new();

    let mut text = doc_text.to_string();
    for bad in KNOWN_INVALID_NAMESPACES {
        if text.contains(bad) {
            text = text.replace(bad, SCHEMA_NAMESPACE);
            changes.push(format!(
                "replaced schema namespace '{bad}' with '{SCHEMA_NAMESPACE}'"
            ));
        }
    }

    let Ok(mut root) = parse_tree(&text) else {
        return unresolved(doc_text);
    };

    fix_image_ids(&mut root, &mut changes);
    if !fix_pixel_blocks(&mut root, &mut changes) {
        return unresolved(doc_text);
    }
    strip_vendor_annotations(&mut root, &mut changes);

    if changes.is_empty() {
        return CleanupOutcome {
            text: doc_text.to_string(),
            changes,
            resolved: true,
        };
    }
    match write_tree(&root) {
        Ok(written) => CleanupOutcome {
            text: written,
            changes,
            resolved: true,
        },
        Err(_) => unresolved(doc_text),
    }
}

/// Image identifiers must carry the `Image:` type prefix.
fn fix_image_ids(root: &mut Element, changes: &mut Vec<String>) {
    for_each_element_mut(root, &mut |el| {
        if local(&el.name) != "Image" {
            return;
        }
        let Some(id) = el.attr("ID") else { return };
        if !id.starts_with("Image:") {
            let fixed = format!("Image:{id}");
            changes.push(format!("prefixed image id '{id}' as '{fixed}'"));
            el.set_attr("ID", &fixed);
        }
    });
}

/// Enforce exactly one data descriptor per pixel-data block and canonical
/// child order (channels, descriptor, planes). Returns false when the
/// descriptor invariant cannot be repaired without guessing.
fn fix_pixel_blocks(root: &mut Element, changes: &mut Vec<String>) -> bool {
    let mut resolved = true;
    for_each_element_mut(root, &mut |el| {
        if !resolved || local(&el.name) != "Pixels" {
            return;
        }
        let before = el.children.clone();
        let mut channels = Vec::new();
        let mut descriptors: Vec<Node> = Vec::new();
        let mut planes = Vec::new();
        let mut others = Vec::new();
        for child in el.children.drain(..) {
            let kind = match &child {
                Node::Element(inner) => local(&inner.name),
                _ => "",
            };
            match kind {
                "Channel" => channels.push(child),
                "BinData" | "TiffData" | "MetadataOnly" => descriptors.push(child),
                "Plane" => planes.push(child),
                _ => others.push(child),
            }
        }

        // one historical converter emitted an empty MetadataOnly next to
        // the real descriptor; dropping it is the only allowed repair
        let mut dropped: Vec<Node> = Vec::new();
        if descriptors.len() > 1 {
            let (redundant, rest): (Vec<Node>, Vec<Node>) =
                descriptors.into_iter().partition(|node| match node {
                    Node::Element(inner) => {
                        local(&inner.name) == "MetadataOnly" && inner.children.is_empty()
                    }
                    _ => false,
                });
            if rest.len() == 1 && !redundant.is_empty() {
                for _ in &redundant {
                    changes.push(
                        "dropped a redundant empty MetadataOnly from a pixel-data block"
                            .to_string(),
                    );
                }
                dropped = redundant;
                descriptors = rest;
            } else {
                descriptors = redundant;
                descriptors.extend(rest);
            }
        }
        if descriptors.len() != 1 {
            resolved = false;
            return;
        }

        el.children = channels;
        el.children.append(&mut descriptors);
        el.children.append(&mut planes);
        el.children.append(&mut others);

        let expected: Vec<Node> = before
            .iter()
            .filter(|&node| !dropped.contains(node))
            .cloned()
            .collect();
        if el.children != expected {
            changes.push("reordered the children of a pixel-data block".to_string());
        }
    });
    resolved
}

/// Remove vendor-internal annotation blocks, every reference to them from
/// image and plane elements, and the annotations container once empty.
fn strip_vendor_annotations(root: &mut Element, changes: &mut Vec<String>) {
    let mut removed_ids: Vec<String> = Vec::new();
    for_each_element_mut(root, &mut |el| {
        if local(&el.name) != "StructuredAnnotations" {
            return;
        }
        el.children.retain(|child| {
            let Node::Element(inner) = child else {
                return true;
            };
            if inner.attr("Namespace") != Some(VENDOR_ANNOTATION_NAMESPACE) {
                return true;
            }
            let id = inner.attr("ID").unwrap_or("?");
            changes.push(format!("removed vendor annotation '{id}'"));
            if let Some(id) = inner.attr("ID") {
                removed_ids.push(id.to_string());
            }
            false
        });
    });

    if !removed_ids.is_empty() {
        for_each_element_mut(root, &mut |el| {
            let kind = local(&el.name);
            if kind != "Image" && kind != "Plane" {
                return;
            }
            el.children.retain(|child| {
                let Node::Element(inner) = child else {
                    return true;
                };
                if local(&inner.name) != "AnnotationRef" {
                    return true;
                }
                let Some(id) = inner.attr("ID") else {
                    return true;
                };
                if removed_ids.iter().any(|removed| removed == id) {
                    changes.push(format!("removed reference to vendor annotation '{id}'"));
                    return false;
                }
                true
            });
        });
    }

    for_each_element_mut(root, &mut |el| {
        el.children.retain(|child| {
            let Node::Element(inner) = child else {
                return true;
            };
            if local(&inner.name) == "StructuredAnnotations" && inner.children.is_empty() {
                changes.push("removed an empty annotations container".to_string());
                return false;
            }
            true
        });
    });
}
