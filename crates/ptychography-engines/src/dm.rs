//! Difference-map engine.
//!
//! All exit waves are updated simultaneously: positions are split into
//! chunks that run in parallel on the rayon pool, each applying
//!
//! `ψ ← ψ + β (Π_F(2 P·O − ψ) − P·O)`
//!
//! after which probe and object are re-estimated from the combined exit
//! waves by the overlap projection. Single-slice objects only, no position
//! correction.

use std::sync::Arc;

use log::{debug, warn};
use ptychography_core::{
    Complex64, ComplexGrid, DiffractionDataset, InitialGuess, Object, PixelPosition, Probe, Real,
    RealGrid, accumulate_patch, extract_patch,
};
use rayon::prelude::*;

use crate::engine::{
    EngineCapabilities, EngineContext, EngineError, ReconstructionEngine, StateUpdate, StepOutput,
    check_divergence, check_guess,
};
use crate::options::EngineOptions;
use crate::projection::{FarField, ResidualStats, measured_amplitude};

/// Relative floor on the overlap-projection denominators.
const OVERLAP_FLOOR: Real = 1e-9;

#[derive(Debug, Default, Clone, Copy)]
pub struct DifferenceMapEngine;

impl DifferenceMapEngine {
    pub const NAME: &'static str = "dm";
}

impl ReconstructionEngine for DifferenceMapEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            position_correction: false,
            multi_slice: false,
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
        if guess.object.is_multi_slice() {
            return Err(EngineError::InvalidInput(
                "difference map reconstructs single-slice objects only".into(),
            ));
        }
        let shape = guess.probe.shape();
        let origins = guess
            .positions
            .points
            .iter()
            .map(|p| guess.geometry.patch_origin(*p, shape))
            .collect();
        debug!(
            "dm: {} positions in chunks of {}, relaxation {}",
            dataset.len(),
            options.chunk_length,
            options.exit_wave_relaxation
        );
        Ok(Box::new(DifferenceMapContext {
            options: options.clone(),
            dataset,
            far_field: FarField::new(shape),
            origins,
            exit_waves: Vec::new(),
            probe: guess.probe,
            object: guess.object,
        }))
    }
}

struct DifferenceMapContext {
    options: EngineOptions,
    /// Each chunk reads its own frames.
    dataset: Arc<DiffractionDataset>,
    far_field: FarField,
    origins: Vec<PixelPosition>,
    /// Per position, per probe mode. Allocated on the first step.
    exit_waves: Vec<Vec<ComplexGrid>>,
    probe: Probe,
    object: Object,
}

impl DifferenceMapContext {
    fn exit_wave_bytes(&self) -> u64 {
        let per_wave = self.probe.shape().len() * std::mem::size_of::<Complex64>();
        (per_wave * self.probe.num_modes() * self.origins.len()) as u64
    }

    fn allocate_exit_waves(&mut self) -> Result<(), EngineError> {
        let needed = self.exit_wave_bytes();
        if let Some(limit) = self.options.memory_limit_bytes {
            if needed > limit {
                warn!("dm: exit waves need {needed} bytes, limit is {limit}");
                return Err(EngineError::ResourceExhausted(format!(
                    "exit waves need {needed} bytes, limit is {limit}"
                )));
            }
        }
        let shape = self.probe.shape();
        self.exit_waves = self
            .origins
            .iter()
            .map(|origin| {
                let patch = extract_patch(&self.object.layers[0], *origin, shape);
                self.probe
                    .modes
                    .iter()
                    .map(|mode| mode.component_mul(&patch))
                    .collect()
            })
            .collect();
        Ok(())
    }

    /// Difference-map update of every exit wave; returns the residuals of `P·O`.
    fn update_exit_waves(&mut self) -> Result<ResidualStats, EngineError> {
        let shape = self.probe.shape();
        let relaxation = self.options.exit_wave_relaxation;
        let probe = &self.probe;
        let object = &self.object.layers[0];
        let far_field = &self.far_field;
        let dataset = &*self.dataset;
        let origins = &self.origins;
        let chunk = self.options.chunk_length;

        self.exit_waves
            .par_chunks_mut(chunk)
            .enumerate()
            .map(|(chunk_index, waves)| -> Result<ResidualStats, EngineError> {
                let mut stats = ResidualStats::default();
                for (offset, psi) in waves.iter_mut().enumerate() {
                    let index = chunk_index * chunk + offset;
                    let measured = measured_amplitude(dataset, index)?;
                    let patch = extract_patch(object, origins[index], shape);
                    let model: Vec<ComplexGrid> = probe
                        .modes
                        .iter()
                        .map(|mode| mode.component_mul(&patch))
                        .collect();
                    stats = stats.merge(far_field.evaluate(&model, &measured));

                    let mut reflected: Vec<ComplexGrid> = model
                        .iter()
                        .zip(psi.iter())
                        .map(|(m, p)| m * Complex64::new(2.0, 0.0) - p)
                        .collect();
                    far_field.project(&mut reflected, &measured);
                    for ((p, r), m) in psi.iter_mut().zip(&reflected).zip(&model) {
                        *p += (r - m) * Complex64::new(relaxation, 0.0);
                    }
                }
                Ok(stats)
            })
            .try_reduce(ResidualStats::default, |a, b| Ok(a.merge(b)))
    }

    /// `O = Σ_j Σ_k conj(P_k) ψ_jk / Σ_j Σ_k |P_k|²` over the illuminated region.
    fn update_object(&mut self) {
        let shape = self.object.shape();
        let probe_shape = self.probe.shape();
        let mut numerator = ComplexGrid::zeros(shape.rows, shape.cols);
        let mut denominator = ComplexGrid::zeros(shape.rows, shape.cols);
        let illumination = self.probe.intensity();
        let conj_modes: Vec<ComplexGrid> = self.probe.modes.iter().map(|m| m.conjugate()).collect();
        let unit = RealGrid::from_element(probe_shape.rows, probe_shape.cols, 1.0);
        let lit = illumination.map(|v| Complex64::new(v, 0.0));

        for (origin, waves) in self.origins.iter().zip(&self.exit_waves) {
            for (conj_mode, psi) in conj_modes.iter().zip(waves) {
                accumulate_patch(&mut numerator, *origin, &conj_mode.component_mul(psi), &unit);
            }
            accumulate_patch(&mut denominator, *origin, &lit, &unit);
        }

        let floor = OVERLAP_FLOOR * denominator.iter().map(|z| z.re).fold(0.0, Real::max);
        let layer = &mut self.object.layers[0];
        for ((o, n), d) in layer.iter_mut().zip(numerator.iter()).zip(denominator.iter()) {
            if d.re > floor {
                *o = *n / d.re;
            }
        }
    }

    /// `P_k = Σ_j conj(O_j) ψ_jk / Σ_j |O_j|²`.
    fn update_probe(&mut self) {
        let shape = self.probe.shape();
        let modes = self.probe.num_modes();
        let mut numerators = vec![ComplexGrid::zeros(shape.rows, shape.cols); modes];
        let mut denominator = RealGrid::zeros(shape.rows, shape.cols);
        for (origin, waves) in self.origins.iter().zip(&self.exit_waves) {
            let patch = extract_patch(&self.object.layers[0], *origin, shape);
            denominator.zip_apply(&patch, |d, o| *d += o.norm_sqr());
            for (numerator, psi) in numerators.iter_mut().zip(waves) {
                numerator.zip_zip_apply(&patch, psi, |n, o, p| *n += o.conj() * p);
            }
        }
        let floor = OVERLAP_FLOOR * denominator.max();
        for (mode, numerator) in self.probe.modes.iter_mut().zip(numerators) {
            mode.zip_zip_apply(&numerator, &denominator, |m, n, d| {
                if d > floor {
                    *m = n / d;
                }
            });
        }
    }
}

impl EngineContext for DifferenceMapContext {
    fn step(&mut self, iteration: usize) -> Result<StepOutput, EngineError> {
        if self.exit_waves.is_empty() {
            self.allocate_exit_waves()?;
        }
        let stats = self.update_exit_waves()?;

        let update_object = self.options.object_plan.is_active(iteration);
        let update_probe = self.options.probe_plan.is_active(iteration);
        if update_object {
            self.update_object();
        }
        if update_probe {
            self.update_probe();
        }

        let metrics = stats.metrics();
        check_divergence(iteration, &self.probe, &self.object, &metrics)?;
        debug!(
            "dm iteration {iteration}: fourier error {:.4e}",
            stats.fourier_error()
        );

        Ok(StepOutput {
            update: StateUpdate {
                probe: update_probe.then(|| self.probe.clone()),
                object: update_object.then(|| self.object.clone()),
                positions: None,
            },
            metrics,
            exhausted: false,
        })
    }
}
