//! Reconstruction models: probe, object and scan positions.
//!
//! All three are plain values; the pipeline owns them inside its
//! reconstruction state and engines produce replacements.

mod object;
mod positions;
mod probe;

pub use object::*;
pub use positions::*;
pub use probe::*;

use thiserror::Error;

use crate::math::{GridShape, Real};

/// Invalid probe, object or position model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("{what} has no modes or layers")]
    Empty { what: &'static str },
    #[error("{what} shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: GridShape,
        actual: GridShape,
    },
    #[error("{what} contains non-finite values")]
    NonFinite { what: &'static str },
    #[error("object has {layers} layers but {spacings} layer spacings")]
    LayerSpacing { layers: usize, spacings: usize },
    #[error("invalid photon energy {0} eV")]
    InvalidEnergy(Real),
}
