use serde::{Deserialize, Serialize};

use super::ModelError;
use crate::math::{ComplexGrid, GridShape, Real, is_finite, polar};

/// Complex transmission estimate, one grid per slice.
///
/// A single layer is the thin-object approximation; `N` layers carry
/// `N − 1` inter-layer distances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub layers: Vec<ComplexGrid>,
    pub layer_spacing_m: Vec<Real>,
}

impl Object {
    pub fn new(layers: Vec<ComplexGrid>, layer_spacing_m: Vec<Real>) -> Result<Self, ModelError> {
        let object = Self {
            layers,
            layer_spacing_m,
        };
        object.validate()?;
        Ok(object)
    }

    pub fn single(layer: ComplexGrid) -> Self {
        Self {
            layers: vec![layer],
            layer_spacing_m: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let first = self.layers.first().ok_or(ModelError::Empty { what: "object" })?;
        let expected = GridShape::of(first);
        for layer in &self.layers {
            let actual = GridShape::of(layer);
            if actual != expected {
                return Err(ModelError::ShapeMismatch {
                    what: "object layer",
                    expected,
                    actual,
                });
            }
            if !is_finite(layer) {
                return Err(ModelError::NonFinite { what: "object" });
            }
        }
        if self.layer_spacing_m.len() + 1 != self.layers.len() {
            return Err(ModelError::LayerSpacing {
                layers: self.layers.len(),
                spacings: self.layer_spacing_m.len(),
            });
        }
        Ok(())
    }

    pub fn shape(&self) -> GridShape {
        self.layers
            .first()
            .map(GridShape::of)
            .unwrap_or(GridShape::new(0, 0))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_multi_slice(&self) -> bool {
        self.layers.len() > 1
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(is_finite)
    }

    /// Product of all layers: the thin-object equivalent of the stack.
    pub fn combined(&self) -> ComplexGrid {
        let mut iter = self.layers.iter();
        let Some(first) = iter.next() else {
            return ComplexGrid::zeros(0, 0);
        };
        let mut out = first.clone();
        for layer in iter {
            out.component_mul_assign(layer);
        }
        out
    }

    /// Split a thin object into `layers` slices whose product is the original:
    /// each slice takes `|O|^(1/n)` and `arg(O)/n`.
    pub fn to_multi_slice(&self, layers: usize, spacing_m: Real) -> Self {
        let layers = layers.max(1);
        let combined = self.combined();
        let exponent = 1.0 / layers as Real;
        let slice = combined.map(|z| polar(z.norm().powf(exponent), z.arg() * exponent));
        Self {
            layers: vec![slice; layers],
            layer_spacing_m: vec![spacing_m; layers - 1],
        }
    }
}
