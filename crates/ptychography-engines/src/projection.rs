//! Far-field modulus constraint shared by the projection engines.

use ptychography_core::{
    ComplexGrid, DiffractionDataset, Fft2, GridShape, Real, RealGrid, amplitude, ifftshift,
};

use crate::engine::{EngineError, IterationMetrics};

/// Keeps the projection finite where the model amplitude vanishes.
const AMPLITUDE_FLOOR: Real = 1e-12;

/// Measured amplitude `sqrt(I)` of frame `index` in natural FFT ordering.
///
/// Read through the dataset on every call; engines keep no frame stack.
pub(crate) fn measured_amplitude(
    dataset: &DiffractionDataset,
    index: usize,
) -> Result<RealGrid, EngineError> {
    Ok(ifftshift(&amplitude(&*dataset.frame(index)?)))
}

/// Accumulated amplitude residuals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct ResidualStats {
    /// `Σ (|Ψ| − M)²`
    pub residual: Real,
    /// `Σ M²`
    pub measured: Real,
    pub pixels: usize,
}

impl ResidualStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            residual: self.residual + other.residual,
            measured: self.measured + other.measured,
            pixels: self.pixels + other.pixels,
        }
    }

    pub fn fourier_error(&self) -> Real {
        if self.measured > 0.0 {
            (self.residual / self.measured).sqrt()
        } else {
            self.residual.sqrt()
        }
    }

    pub fn cost(&self) -> Real {
        if self.pixels == 0 {
            0.0
        } else {
            self.residual / self.pixels as Real
        }
    }

    pub fn metrics(&self) -> IterationMetrics {
        IterationMetrics::new()
            .with(IterationMetrics::FOURIER_ERROR, self.fourier_error())
            .with(IterationMetrics::COST, self.cost())
    }
}

/// Detector-plane transforms for a fixed frame shape.
#[derive(Debug, Clone)]
pub(crate) struct FarField {
    fft: Fft2,
}

impl FarField {
    pub fn new(shape: GridShape) -> Self {
        Self {
            fft: Fft2::new(shape),
        }
    }

    /// Replace the far-field amplitude of the incoherent mode set `waves`
    /// with `measured`, keeping each mode's phase. Returns the residuals of
    /// the incoming waves.
    pub fn project(&self, waves: &mut [ComplexGrid], measured: &RealGrid) -> ResidualStats {
        for wave in waves.iter_mut() {
            self.fft.forward(wave);
        }
        let model = model_amplitude(waves);
        let stats = residuals(&model, measured);
        let ratio = model.zip_map(measured, |a, m| m / (a + AMPLITUDE_FLOOR));
        for wave in waves.iter_mut() {
            wave.zip_apply(&ratio, |z, r| *z *= r);
            self.fft.inverse(wave);
        }
        stats
    }

    /// Residuals of `waves` without modifying them.
    pub fn evaluate(&self, waves: &[ComplexGrid], measured: &RealGrid) -> ResidualStats {
        let spectra: Vec<ComplexGrid> = waves.iter().map(|w| self.fft.forward_of(w)).collect();
        residuals(&model_amplitude(&spectra), measured)
    }
}

fn model_amplitude(spectra: &[ComplexGrid]) -> RealGrid {
    let (rows, cols) = spectra.first().map(|s| s.shape()).unwrap_or((0, 0));
    let mut power = RealGrid::zeros(rows, cols);
    for spectrum in spectra {
        power.zip_apply(spectrum, |p, z| *p += z.norm_sqr());
    }
    power.map(Real::sqrt)
}

fn residuals(model: &RealGrid, measured: &RealGrid) -> ResidualStats {
    let residual = model
        .iter()
        .zip(measured.iter())
        .map(|(a, m)| (a - m).powi(2))
        .sum();
    ResidualStats {
        residual,
        measured: measured.iter().map(|m| m * m).sum(),
        pixels: measured.len(),
    }
}
