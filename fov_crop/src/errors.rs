//! Typed failure taxonomy for the cropping core.
//!
//! All of these abort the whole FOV when raised during full-field work;
//! the orchestrator decides per-cell-fatal by the phase that raised them.
#![allow(missing_docs)]

use std::path::PathBuf;
use thiserror::Error;

/// Spatial shape disagreement between two recipe sources.
#[derive(Debug, Error)]
#[error(
    "channel '{channel}' from {path:?} has shape {found:?} (Z,Y,X), expected {expected:?}"
)]
pub struct ShapeMismatchError {
    pub channel: String,
    pub path: PathBuf,
    pub expected: (usize, usize, usize),
    pub found: (usize, usize, usize),
}

/// A source channel index beyond the source's available channel count.
#[derive(Debug, Error)]
#[error("channel {requested} requested from {path:?} which has {available} channels")]
pub struct MissingChannelError {
    pub path: PathBuf,
    pub requested: usize,
    pub available: usize,
}

/// The primary source carries no structured metadata document at all.
#[derive(Debug, Error)]
#[error("{path:?} carries no structured metadata document")]
pub struct UnsupportedDocumentError {
    pub path: PathBuf,
}
