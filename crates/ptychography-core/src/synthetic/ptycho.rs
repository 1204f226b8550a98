use serde::{Deserialize, Serialize};

use crate::dataset::{DatasetError, DiffractionDataset, SourceDescriptor};
use crate::fft::{Fft2, fftshift};
use crate::geometry::{DetectorGeometry, ObjectGeometry, ScanPoint};
use crate::init::InitError;
use crate::math::{Complex64, ComplexGrid, GridShape, Real, intensity, polar, total_power};
use crate::models::{Object, Probe, ScanPositions};
use crate::noise::SeededNoise;
use crate::patch::extract_patch;

/// Regular raster, row by row, starting at the origin.
pub fn raster_positions(rows: usize, cols: usize, step_m: Real) -> Vec<ScanPoint> {
    (0..rows)
        .flat_map(|r| (0..cols).map(move |c| ScanPoint::new(c as Real * step_m, r as Real * step_m)))
        .collect()
}

/// Fermat spiral with `n` points and mean spacing close to `step_m`.
pub fn fermat_spiral_positions(n: usize, step_m: Real) -> Vec<ScanPoint> {
    let golden = std::f64::consts::PI * (3.0 - (5.0 as Real).sqrt());
    (0..n)
        .map(|k| {
            let radius = step_m * (k as Real).sqrt();
            let theta = k as Real * golden;
            ScanPoint::new(radius * theta.cos(), radius * theta.sin())
        })
        .collect()
}

/// Centred Gaussian spot with total power `power`.
pub fn gaussian_probe(shape: GridShape, sigma_px: Real, power: Real) -> ComplexGrid {
    let cr = (shape.rows / 2) as Real;
    let cc = (shape.cols / 2) as Real;
    let mut probe = ComplexGrid::from_fn(shape.rows, shape.cols, |r, c| {
        let d2 = (r as Real - cr).powi(2) + (c as Real - cc).powi(2);
        // Weak curvature gives the probe a non-trivial phase.
        polar((-0.5 * d2 / (sigma_px * sigma_px)).exp(), 0.5 * d2 / (shape.cols as Real).powi(2))
    });
    let current = total_power(&probe);
    if current > 0.0 {
        probe *= Complex64::new((power / current).sqrt(), 0.0);
    }
    probe
}

/// Smooth amplitude/phase test object with a little seeded texture.
pub fn phase_object(shape: GridShape, max_phase: Real, min_amplitude: Real, seed: u64) -> ComplexGrid {
    let noise = SeededNoise::new(seed);
    let tau = 2.0 * std::f64::consts::PI;
    ComplexGrid::from_fn(shape.rows, shape.cols, |r, c| {
        let (y, x) = (r as Real, c as Real);
        let wave = 0.5 * (1.0 + (tau * y / 37.0).sin() * (tau * x / 53.0).cos());
        let texture = 0.05 * noise.uniform(0, r * shape.cols + c, 1.0);
        let phase = max_phase * (wave + texture).clamp(0.0, 1.0);
        let amp = 1.0 - (1.0 - min_amplitude) * (1.0 - wave);
        polar(amp.clamp(0.0, 1.0), phase)
    })
}

/// Parameters of a simulated far-field ptychography scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticScan {
    pub frame_shape: GridShape,
    pub scan_rows: usize,
    pub scan_cols: usize,
    /// Raster step in object pixels.
    pub step_px: Real,
    pub detector: DetectorGeometry,
    pub energy_ev: Real,
    /// Probe sigma as a fraction of the frame width.
    pub probe_sigma_fraction: Real,
    /// Total probe power `Σ|P|²`.
    pub probe_power: Real,
    pub object_max_phase: Real,
    pub object_min_amplitude: Real,
    pub padding_px: usize,
    /// Frames are simulated at positions displaced by up to this many pixels;
    /// the dataset reports the nominal raster.
    pub position_jitter_px: Real,
    pub seed: u64,
}

impl Default for SyntheticScan {
    fn default() -> Self {
        Self {
            frame_shape: GridShape::square(64),
            scan_rows: 6,
            scan_cols: 6,
            step_px: 16.0,
            detector: DetectorGeometry::default(),
            energy_ev: 8_000.0,
            probe_sigma_fraction: 0.15,
            probe_power: 1.0e6,
            object_max_phase: 1.0,
            object_min_amplitude: 0.8,
            padding_px: 4,
            position_jitter_px: 0.0,
            seed: 1,
        }
    }
}

/// Simulated dataset plus the ground truth that produced it.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub dataset: DiffractionDataset,
    pub probe: Probe,
    pub object: Object,
    pub true_positions: ScanPositions,
    pub geometry: ObjectGeometry,
}

impl SyntheticScan {
    pub fn num_positions(&self) -> usize {
        self.scan_rows * self.scan_cols
    }

    /// Run the forward model `I = |F{P · O_patch}|²`, zero frequency centred.
    pub fn simulate(&self) -> Result<SyntheticData, InitError> {
        let pixel = self
            .detector
            .object_pixel_geometry(self.frame_shape, self.energy_ev)?;
        let nominal = raster_positions(self.scan_rows, self.scan_cols, self.step_px * pixel.width_m);

        let jitter = SeededNoise::new(self.seed ^ 0xA5A5);
        let true_points: Vec<ScanPoint> = nominal
            .iter()
            .enumerate()
            .map(|(i, p)| {
                p.offset(
                    jitter.uniform(0, i, self.position_jitter_px) * pixel.width_m,
                    jitter.uniform(1, i, self.position_jitter_px) * pixel.height_m,
                )
            })
            .collect();

        let geometry = ObjectGeometry::covering(&nominal, self.frame_shape, pixel, self.padding_px)?;
        let object = phase_object(
            geometry.shape,
            self.object_max_phase,
            self.object_min_amplitude,
            self.seed,
        );
        let sigma_px = self.probe_sigma_fraction * self.frame_shape.cols as Real;
        let probe = gaussian_probe(self.frame_shape, sigma_px, self.probe_power);

        let fft = Fft2::new(self.frame_shape);
        let frames = true_points
            .iter()
            .map(|p| {
                let origin = geometry.patch_origin(*p, self.frame_shape);
                let patch = extract_patch(&object, origin, self.frame_shape);
                let mut wave = probe.component_mul(&patch);
                fft.forward(&mut wave);
                fftshift(&intensity(&wave))
            })
            .collect();

        let dataset = DiffractionDataset::from_frames(
            SourceDescriptor::new("synthetic", "memory"),
            self.detector,
            self.energy_ev,
            frames,
            nominal,
            0.1,
        )
        .map_err(DatasetError::from)?;

        Ok(SyntheticData {
            dataset,
            probe: Probe::single(probe, self.energy_ev)?,
            object: Object::single(object),
            true_positions: ScanPositions::new(true_points),
            geometry,
        })
    }
}
