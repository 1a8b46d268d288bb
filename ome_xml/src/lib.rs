//!
//! Structured metadata documents embedded in microscopy acquisitions:
//! a typed value model, channel/plane reconciliation after selection and
//! cropping, and cleanup of documents produced by historically buggy
//! writers.
//!
//! Every transformation is a pure function returning a new value; nothing
//! in this crate mutates a document in place.
//!
#![allow(missing_docs)]

mod cleanup;
mod document;
mod select;
mod xml_tree;

pub use cleanup::{clean_known_issues, CleanupOutcome};
pub use document::{ChannelDef, DataDescriptor, MetadataDocument, PlaneDef};
pub use select::{filter_z_window, select_channels};

use thiserror::Error;

/// Canonical schema namespace expected by downstream validators.
pub const SCHEMA_NAMESPACE: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";

/// Failures raised while parsing or reconciling a metadata document.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The text is not a structured metadata document we can work with.
    #[error("unsupported metadata document: {0}")]
    Unsupported(String),
    /// A structural invariant (channel/plane counts, index validity) failed.
    #[error("metadata invariant violated: {0}")]
    Invariant(String),
}
