//! Angular-spectrum free-space propagation between object slices.

use ptychography_core::{Complex64, ComplexGrid, Fft2, GridShape, PixelGeometry, Real};

/// Propagator for a fixed grid, sampling, wavelength and distance.
#[derive(Debug, Clone)]
pub struct AngularSpectrum {
    fft: Fft2,
    /// Transfer function in natural FFT ordering.
    transfer: ComplexGrid,
}

impl AngularSpectrum {
    pub fn new(shape: GridShape, pixel: PixelGeometry, wavelength_m: Real, distance_m: Real) -> Self {
        let inv_lambda_sq = 1.0 / (wavelength_m * wavelength_m);
        let tau = 2.0 * std::f64::consts::PI;
        let transfer = ComplexGrid::from_fn(shape.rows, shape.cols, |r, c| {
            let fy = frequency(r, shape.rows) / (shape.rows as Real * pixel.height_m);
            let fx = frequency(c, shape.cols) / (shape.cols as Real * pixel.width_m);
            let arg = inv_lambda_sq - fx * fx - fy * fy;
            if arg > 0.0 {
                let phase = tau * distance_m * arg.sqrt();
                Complex64::new(phase.cos(), phase.sin())
            } else {
                // Evanescent components do not reach the next slice.
                Complex64::new(0.0, 0.0)
            }
        });
        Self {
            fft: Fft2::new(shape),
            transfer,
        }
    }

    /// Same geometry, opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            fft: self.fft.clone(),
            transfer: self.transfer.map(|h| h.conj()),
        }
    }

    pub fn apply(&self, wave: &mut ComplexGrid) {
        self.fft.forward(wave);
        wave.component_mul_assign(&self.transfer);
        self.fft.inverse(wave);
    }

    pub fn propagate(&self, wave: &ComplexGrid) -> ComplexGrid {
        let mut out = wave.clone();
        self.apply(&mut out);
        out
    }
}

/// Signed frequency index of FFT bin `k` for length `n`.
fn frequency(k: usize, n: usize) -> Real {
    if k < n.div_ceil(2) {
        k as Real
    } else {
        k as Real - n as Real
    }
}
