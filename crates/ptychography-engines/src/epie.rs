//! Extended ptychographic iterative engine.
//!
//! Positions are visited in ascending index order. At each position the
//! exit wave is pushed through the far-field modulus constraint and the
//! difference is fed back into object and probe with step sizes α and β,
//! normalised by the peak illumination (Maiden & Rodenburg 2009).
//!
//! Extensions handled here:
//! - mixed-state probes (incoherent modes share one measured intensity),
//! - multi-slice objects (3PIE: angular-spectrum propagation between
//!   slices, updates back-propagated slice by slice),
//! - gradient-based position correction with a per-iteration step limit.

use std::sync::Arc;

use log::debug;
use ptychography_core::{
    Complex64, ComplexGrid, DiffractionDataset, GridShape, InitialGuess, Object, ObjectGeometry,
    PixelPosition, Probe, Real, RealGrid, ScanPositions, add_patch, extract_patch,
};

use crate::engine::{
    EngineCapabilities, EngineContext, EngineError, IterationMetrics, ReconstructionEngine,
    StateUpdate, StepOutput, check_divergence, check_guess,
};
use crate::options::EngineOptions;
use crate::projection::{FarField, ResidualStats, measured_amplitude};
use crate::propagation::AngularSpectrum;

#[derive(Debug, Default, Clone, Copy)]
pub struct EpieEngine;

impl EpieEngine {
    pub const NAME: &'static str = "epie";
}

impl ReconstructionEngine for EpieEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            position_correction: true,
            multi_slice: true,
        }
    }

    fn initialize(
        &self,
        dataset: Arc<DiffractionDataset>,
        guess: InitialGuess,
        options: &EngineOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        options.validate()?;
        check_guess(&dataset, &guess)?;
        let shape = guess.probe.shape();
        let wavelength = guess.probe.wavelength_m();
        let propagators = guess
            .object
            .layer_spacing_m
            .iter()
            .map(|&d| {
                let forward = AngularSpectrum::new(shape, guess.geometry.pixel, wavelength, d);
                let backward = forward.reversed();
                (forward, backward)
            })
            .collect();
        debug!(
            "epie: {} positions, {} probe modes, {} object slices",
            dataset.len(),
            guess.probe.num_modes(),
            guess.object.num_layers()
        );
        Ok(Box::new(EpieContext {
            options: options.clone(),
            dataset,
            far_field: FarField::new(shape),
            propagators,
            probe: guess.probe,
            object: guess.object,
            positions: guess.positions,
            geometry: guess.geometry,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct Flags {
    object: bool,
    probe: bool,
    positions: bool,
}

struct EpieContext {
    options: EngineOptions,
    /// Frames are read one position at a time during the sweep.
    dataset: Arc<DiffractionDataset>,
    far_field: FarField,
    /// `(forward, backward)` per inter-slice gap.
    propagators: Vec<(AngularSpectrum, AngularSpectrum)>,
    probe: Probe,
    object: Object,
    positions: ScanPositions,
    geometry: ObjectGeometry,
}

impl EngineContext for EpieContext {
    fn step(&mut self, iteration: usize) -> Result<StepOutput, EngineError> {
        let flags = Flags {
            object: self.options.object_plan.is_active(iteration),
            probe: self.options.probe_plan.is_active(iteration),
            positions: self.options.position_correction
                && self.options.position_plan.is_active(iteration),
        };

        let mut stats = ResidualStats::default();
        let mut shift_sum = 0.0;
        for index in 0..self.positions.len() {
            let (position_stats, shift) = self.visit(index, flags)?;
            stats = stats.merge(position_stats);
            shift_sum += shift;
        }

        let mut metrics = stats.metrics();
        if flags.positions {
            metrics.insert(
                IterationMetrics::POSITION_SHIFT,
                shift_sum / self.positions.len().max(1) as Real,
            );
        }
        check_divergence(iteration, &self.probe, &self.object, &metrics)?;

        Ok(StepOutput {
            update: StateUpdate {
                probe: flags.probe.then(|| self.probe.clone()),
                object: flags.object.then(|| self.object.clone()),
                positions: flags.positions.then(|| self.positions.clone()),
            },
            metrics,
            exhausted: false,
        })
    }
}

impl EpieContext {
    /// Update at one scan position; returns its residuals and the applied shift (pixels).
    fn visit(&mut self, index: usize, flags: Flags) -> Result<(ResidualStats, Real), EngineError> {
        let shape = self.probe.shape();
        let point = self.positions.points[index];
        let origin = self.geometry.patch_origin(point, shape);
        let layers = self.object.num_layers();

        let patches: Vec<ComplexGrid> = self
            .object
            .layers
            .iter()
            .map(|layer| extract_patch(layer, origin, shape))
            .collect();

        // Forward pass: incident wave on every slice, per mode.
        let mut incident: Vec<Vec<ComplexGrid>> = Vec::with_capacity(layers);
        let mut wave = self.probe.modes.clone();
        for (l, patch) in patches.iter().enumerate() {
            if l > 0 {
                for w in wave.iter_mut() {
                    self.propagators[l - 1].0.apply(w);
                }
            }
            incident.push(wave.clone());
            for w in wave.iter_mut() {
                w.component_mul_assign(patch);
            }
        }

        let measured = measured_amplitude(&self.dataset, index)?;
        let mut target = wave;
        let stats = self.far_field.project(&mut target, &measured);

        // Backward pass, last slice first.
        let mut shift_px = 0.0;
        for l in (0..layers).rev() {
            let patch = &patches[l];
            let deltas: Vec<ComplexGrid> = incident[l]
                .iter()
                .zip(target.iter())
                .map(|(inc, t)| t - inc.component_mul(patch))
                .collect();

            if l == 0 && flags.positions {
                shift_px = self.correct_position(index, origin, patch, &deltas);
            }

            if flags.object {
                let delta = object_delta(&incident[l], &deltas, self.options.object_step_size);
                add_patch(&mut self.object.layers[l], origin, &delta);
            }

            let revised = incident_update(&incident[l], patch, &deltas, self.options.probe_step_size);
            if l > 0 {
                target = revised
                    .into_iter()
                    .map(|w| self.propagators[l - 1].1.propagate(&w))
                    .collect();
            } else if flags.probe {
                self.probe.modes = revised;
            }
        }

        Ok((stats, shift_px))
    }

    /// Least-squares sub-pixel shift of position `index`; returns the applied
    /// shift magnitude in pixels.
    fn correct_position(
        &mut self,
        index: usize,
        origin: PixelPosition,
        patch: &ComplexGrid,
        deltas: &[ComplexGrid],
    ) -> Real {
        let shape = GridShape::of(patch);
        let (grad_rows, grad_cols) = gradients(patch);
        let estimate = |grad: &ComplexGrid| -> Real {
            let mut num = 0.0;
            let mut den = 0.0;
            for (mode, delta) in self.probe.modes.iter().zip(deltas) {
                for ((p, g), d) in mode.iter().zip(grad.iter()).zip(delta.iter()) {
                    let dpsi = p * g;
                    num += (dpsi.conj() * d).re;
                    den += dpsi.norm_sqr();
                }
            }
            if den > 0.0 { num / den } else { 0.0 }
        };
        let target_row = estimate(&grad_rows);
        let target_col = estimate(&grad_cols);

        // Shift is measured relative to the rounded patch; move the exact
        // position there rather than accumulating on top of its fraction.
        let point = self.positions.points[index];
        let (exact_row, exact_col) = self.geometry.patch_origin_exact(point, shape);
        let step = self.options.position_step_size;
        let mut d_row = step * (origin.row as Real + target_row - exact_row);
        let mut d_col = step * (origin.col as Real + target_col - exact_col);

        let magnitude = (d_row * d_row + d_col * d_col).sqrt();
        let limit = self.options.position_magnitude_limit_px;
        if magnitude > limit && magnitude > 0.0 {
            d_row *= limit / magnitude;
            d_col *= limit / magnitude;
        }
        let (dx_m, dy_m) = self.geometry.pixels_to_metres(d_row, d_col);
        self.positions.points[index] = point.offset(dx_m, dy_m);
        (d_row * d_row + d_col * d_col).sqrt()
    }
}

/// `α Σ_k conj(ψ_k) Δ_k / max Σ_k |ψ_k|²`
fn object_delta(incident: &[ComplexGrid], deltas: &[ComplexGrid], step: Real) -> ComplexGrid {
    let (rows, cols) = incident[0].shape();
    let mut power = RealGrid::zeros(rows, cols);
    let mut numerator = ComplexGrid::zeros(rows, cols);
    for (inc, delta) in incident.iter().zip(deltas) {
        power.zip_apply(inc, |p, z| *p += z.norm_sqr());
        numerator.zip_zip_apply(inc, delta, |n, z, d| *n += z.conj() * d);
    }
    let peak = power.max();
    if peak <= 0.0 {
        return ComplexGrid::zeros(rows, cols);
    }
    numerator * Complex64::new(step / peak, 0.0)
}

/// `ψ_k + β conj(O) Δ_k / max |O|²` per mode.
fn incident_update(
    incident: &[ComplexGrid],
    patch: &ComplexGrid,
    deltas: &[ComplexGrid],
    step: Real,
) -> Vec<ComplexGrid> {
    let peak = patch.iter().map(|z| z.norm_sqr()).fold(0.0, Real::max);
    let gain = if peak > 0.0 { step / peak } else { 0.0 };
    incident
        .iter()
        .zip(deltas)
        .map(|(inc, delta)| {
            let mut out = inc.clone();
            out.zip_zip_apply(patch, delta, |w, o, d| *w += o.conj() * d * gain);
            out
        })
        .collect()
}

/// Central-difference gradients along rows and columns, one-sided at the edges.
fn gradients(grid: &ComplexGrid) -> (ComplexGrid, ComplexGrid) {
    let (rows, cols) = grid.shape();
    let diff = |lo: usize, hi: usize, a: Complex64, b: Complex64| -> Complex64 {
        if hi > lo { (b - a) / (hi - lo) as Real } else { Complex64::new(0.0, 0.0) }
    };
    let d_row = ComplexGrid::from_fn(rows, cols, |r, c| {
        let lo = r.saturating_sub(1);
        let hi = (r + 1).min(rows - 1);
        diff(lo, hi, grid[(lo, c)], grid[(hi, c)])
    });
    let d_col = ComplexGrid::from_fn(rows, cols, |r, c| {
        let lo = c.saturating_sub(1);
        let hi = (c + 1).min(cols - 1);
        diff(lo, hi, grid[(r, lo)], grid[(r, hi)])
    });
    (d_row, d_col)
}
