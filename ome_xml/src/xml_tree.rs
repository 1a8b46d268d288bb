//! Minimal mutable element tree over quick-xml events.
//!
//! Documents we receive may carry arbitrary vendor content alongside the
//! elements we understand, so cleanup works on a generic tree rather than
//! the typed document model.

use crate::MetadataError;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }
}

/// Local part of a possibly prefixed element name.
pub(crate) fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Depth-first search for the first element with the given local name.
pub(crate) fn find_first<'a>(el: &'a Element, name: &str) -> Option<&'a Element> {
    if local(&el.name) == name {
        return Some(el);
    }
    el.child_elements().find_map(|child| find_first(child, name))
}

/// Visit every element in the tree, parents before children.
pub(crate) fn for_each_element_mut(el: &mut Element, visit: &mut impl FnMut(&mut Element)) {
    visit(el);
    for child in &mut el.children {
        if let Node::Element(inner) = child {
            for_each_element_mut(inner, visit);
        }
    }
}

pub(crate) fn malformed<E: Display>(err: E) -> MetadataError {
    MetadataError::Unsupported(format!("malformed document: {err}"))
}

fn element_from(start: &BytesStart<'_>) -> Result<Element, MetadataError> {
    let name = String::from_utf8(start.name().as_ref().to_vec()).map_err(malformed)?;
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = String::from_utf8(attr.key.as_ref().to_vec()).map_err(malformed)?;
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    node: Node,
) -> Result<(), MetadataError> {
    if let Some(top) = stack.last_mut() {
        top.children.push(node);
        return Ok(());
    }
    match node {
        Node::Element(el) => {
            if root.is_some() {
                return Err(MetadataError::Unsupported(
                    "document has multiple root elements".to_string(),
                ));
            }
            *root = Some(el);
            Ok(())
        }
        // stray text outside the root is insignificant whitespace
        _ => Ok(()),
    }
}

pub(crate) fn parse_tree(text: &str) -> Result<Element, MetadataError> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let el = element_from(&start)?;
                attach(&mut stack, &mut root, Node::Element(el))?;
            }
            Event::End(_) => {
                let el = stack.pop().ok_or_else(|| {
                    MetadataError::Unsupported("unbalanced closing tag".to_string())
                })?;
                attach(&mut stack, &mut root, Node::Element(el))?;
            }
            Event::Text(text) => {
                let content = text.unescape().map_err(malformed)?.into_owned();
                if !content.trim().is_empty() {
                    attach(&mut stack, &mut root, Node::Text(content))?;
                }
            }
            Event::CData(data) => {
                let content = String::from_utf8(data.to_vec()).map_err(malformed)?;
                attach(&mut stack, &mut root, Node::Text(content))?;
            }
            Event::Comment(text) => {
                let content = String::from_utf8(text.to_vec()).map_err(malformed)?;
                attach(&mut stack, &mut root, Node::Comment(content))?;
            }
            Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }
    if !stack.is_empty() {
        return Err(MetadataError::Unsupported(
            "document ends inside an open element".to_string(),
        ));
    }
    root.ok_or_else(|| MetadataError::Unsupported("document has no root element".to_string()))
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &Element) -> Result<(), MetadataError> {
    let mut start = BytesStart::new(el.name.as_str());
    for (key, value) in &el.attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if el.children.is_empty() {
        writer.write_event(Event::Empty(start)).map_err(malformed)?;
        return Ok(());
    }
    writer.write_event(Event::Start(start)).map_err(malformed)?;
    for child in &el.children {
        match child {
            Node::Element(inner) => write_element(writer, inner)?,
            Node::Text(text) => writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(malformed)?,
            Node::Comment(text) => writer
                .write_event(Event::Comment(BytesText::from_escaped(text.as_str())))
                .map_err(malformed)?,
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(el.name.as_str())))
        .map_err(malformed)
}

pub(crate) fn write_tree(root: &Element) -> Result<String, MetadataError> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(malformed)?;
    write_element(&mut writer, root)?;
    String::from_utf8(writer.into_inner()).map_err(malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_is_stable() -> Result<(), MetadataError> {
        let text = r#"<?xml version="1.0" encoding="UTF-8"?><Root a="1"><Child b="x &amp; y"/><Child>text</Child></Root>"#;
        let tree = parse_tree(text)?;
        let written = write_tree(&tree)?;
        assert_eq!(written, text);
        let reparsed = parse_tree(&written)?;
        assert_eq!(tree, reparsed);
        Ok(())
    }

    #[test]
    fn test_rejects_unbalanced_document() {
        assert!(parse_tree("<Root><Child></Root>").is_err());
        assert!(parse_tree("").is_err());
    }
}
