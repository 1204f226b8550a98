use serde::{Deserialize, Serialize};

use super::ModelError;
use crate::math::{ComplexGrid, GridShape, Real, is_finite, total_power, wavelength_m};

/// Mixed-state illumination: one or more mutually incoherent modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub modes: Vec<ComplexGrid>,
    pub energy_ev: Real,
}

impl Probe {
    pub fn new(modes: Vec<ComplexGrid>, energy_ev: Real) -> Result<Self, ModelError> {
        let probe = Self { modes, energy_ev };
        probe.validate()?;
        Ok(probe)
    }

    pub fn single(mode: ComplexGrid, energy_ev: Real) -> Result<Self, ModelError> {
        Self::new(vec![mode], energy_ev)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let first = self.modes.first().ok_or(ModelError::Empty { what: "probe" })?;
        let expected = GridShape::of(first);
        for mode in &self.modes {
            let actual = GridShape::of(mode);
            if actual != expected {
                return Err(ModelError::ShapeMismatch {
                    what: "probe mode",
                    expected,
                    actual,
                });
            }
            if !is_finite(mode) {
                return Err(ModelError::NonFinite { what: "probe" });
            }
        }
        if !(self.energy_ev.is_finite() && self.energy_ev > 0.0) {
            return Err(ModelError::InvalidEnergy(self.energy_ev));
        }
        Ok(())
    }

    pub fn shape(&self) -> GridShape {
        self.modes
            .first()
            .map(GridShape::of)
            .unwrap_or(GridShape::new(0, 0))
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    pub fn wavelength_m(&self) -> Real {
        wavelength_m(self.energy_ev)
    }

    /// Summed power of all modes.
    pub fn power(&self) -> Real {
        self.modes.iter().map(total_power).sum()
    }

    /// Pixel-wise incoherent intensity `Σ_k |P_k|²`.
    pub fn intensity(&self) -> crate::math::RealGrid {
        let shape = self.shape();
        let mut out = crate::math::RealGrid::zeros(shape.rows, shape.cols);
        for mode in &self.modes {
            out.zip_apply(mode, |acc, z| *acc += z.norm_sqr());
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        self.modes.iter().all(is_finite)
    }
}
