//! Learned single-shot inference engine.
//!
//! A trained [`InferenceModel`] maps each measured diffraction amplitude
//! directly to an object patch. Patches are stitched into the object,
//! weighted by the probe intensity at each pixel. The engine walks the scan
//! once (optionally a few positions per step) and then reports itself
//! exhausted.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use nalgebra::DMatrix;
use ptychography_core::{
    ComplexGrid, DiffractionDataset, GridShape, InitialGuess, Object, PixelPosition,
    Probe, Real, RealGrid, accumulate_patch, amplitude, extract_patch, ifftshift, polar,
};
use serde::{Deserialize, Serialize};

use crate::engine::{
    EngineCapabilities, EngineContext, EngineError, IterationMetrics, ReconstructionEngine,
    StateUpdate, StepOutput, check_divergence, check_guess,
};
use crate::options::EngineOptions;
use crate::projection::{FarField, ResidualStats};

/// Diffraction amplitude → object patch regressor.
pub trait InferenceModel: Send + Sync {
    /// Frame shape the model was trained on; also the patch shape it returns.
    fn input_shape(&self) -> GridShape;

    /// Infer the object patch for a detector-centred measured amplitude.
    fn infer(&self, measured_amplitude: &RealGrid) -> Result<ComplexGrid, EngineError>;
}

/// Weights file layout of [`SeparableLinearModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparableLinearWeights {
    /// `rows × rows`, row-major.
    pub left: Vec<Vec<Real>>,
    /// `cols × cols`, row-major.
    pub right: Vec<Vec<Real>>,
    #[serde(default = "one")]
    pub phase_scale: Real,
    #[serde(default)]
    pub phase_bias: Real,
    #[serde(default)]
    pub amplitude_gain: Real,
    #[serde(default = "one")]
    pub amplitude_bias: Real,
}

fn one() -> Real {
    1.0
}

/// Linear model `F = L · X̂ · R` on the peak-normalised amplitude `X̂`,
/// decoded as phase `s·F + b` and amplitude `clamp(a₀ + g·F, 0, 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparableLinearModel {
    left: DMatrix<Real>,
    right: DMatrix<Real>,
    phase_scale: Real,
    phase_bias: Real,
    amplitude_gain: Real,
    amplitude_bias: Real,
}

impl SeparableLinearModel {
    pub fn from_weights(weights: SeparableLinearWeights) -> Result<Self, EngineError> {
        let left = square_matrix("left", &weights.left)?;
        let right = square_matrix("right", &weights.right)?;
        Ok(Self {
            left,
            right,
            phase_scale: weights.phase_scale,
            phase_bias: weights.phase_bias,
            amplitude_gain: weights.amplitude_gain,
            amplitude_bias: weights.amplitude_bias,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let weights: SeparableLinearWeights = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidInput(format!("model weights: {e}")))?;
        Self::from_weights(weights)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidInput(format!("reading model {}: {e}", path.display()))
        })?;
        let model = Self::from_json_str(&json)?;
        info!("loaded inference model {} ({})", path.display(), model.input_shape());
        Ok(model)
    }

    /// Model that predicts a constant patch `polar(amplitude, phase)`.
    pub fn constant(shape: GridShape, amplitude: Real, phase: Real) -> Self {
        Self {
            left: DMatrix::zeros(shape.rows, shape.rows),
            right: DMatrix::zeros(shape.cols, shape.cols),
            phase_scale: 0.0,
            phase_bias: phase,
            amplitude_gain: 0.0,
            amplitude_bias: amplitude,
        }
    }
}

fn square_matrix(name: &str, rows: &[Vec<Real>]) -> Result<DMatrix<Real>, EngineError> {
    let n = rows.len();
    if n == 0 || rows.iter().any(|r| r.len() != n) {
        return Err(EngineError::InvalidInput(format!(
            "model weights '{name}' must be a non-empty square matrix"
        )));
    }
    Ok(DMatrix::from_fn(n, n, |r, c| rows[r][c]))
}

impl InferenceModel for SeparableLinearModel {
    fn input_shape(&self) -> GridShape {
        GridShape::new(self.left.nrows(), self.right.ncols())
    }

    fn infer(&self, measured_amplitude: &RealGrid) -> Result<ComplexGrid, EngineError> {
        let actual = GridShape::of(measured_amplitude);
        if actual != self.input_shape() {
            return Err(EngineError::InvalidInput(format!(
                "model expects {} input, got {actual}",
                self.input_shape()
            )));
        }
        let peak = measured_amplitude.max();
        let normalised = if peak > 0.0 {
            measured_amplitude / peak
        } else {
            measured_amplitude.clone()
        };
        let features = &self.left * normalised * &self.right;
        Ok(features.map(|f| {
            let a = (self.amplitude_bias + self.amplitude_gain * f).clamp(0.0, 1.0);
            polar(a, self.phase_bias + self.phase_scale * f)
        }))
    }
}

/// Learned engine; the model is shared by every run.
#[derive(Clone)]
pub struct LearnedEngine {
    model: Arc<dyn InferenceModel>,
}

impl LearnedEngine {
    pub const NAME: &'static str = "ptychonn";

    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self { model }
    }
}

impl ReconstructionEngine for LearnedEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    fn initialize(
        &self,
        dataset: Arc<DiffractionDataset>,
        guess: InitialGuess,
        options: &EngineOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        options.validate()?;
        check_guess(&dataset, &guess)?;
        if self.model.input_shape() != dataset.frame_shape() {
            return Err(EngineError::InvalidInput(format!(
                "model input {} does not match frame shape {}",
                self.model.input_shape(),
                dataset.frame_shape()
            )));
        }
        if guess.object.is_multi_slice() {
            return Err(EngineError::InvalidInput(
                "learned inference produces single-slice objects only".into(),
            ));
        }
        let shape = guess.probe.shape();
        let object_shape = guess.object.shape();
        let origins = guess
            .positions
            .points
            .iter()
            .map(|p| guess.geometry.patch_origin(*p, shape))
            .collect();
        let per_step = options
            .positions_per_step
            .unwrap_or(dataset.len())
            .min(dataset.len());
        debug!(
            "ptychonn: {} positions, {} per step",
            dataset.len(),
            per_step
        );
        Ok(Box::new(LearnedContext {
            model: Arc::clone(&self.model),
            dataset: Arc::clone(&dataset),
            far_field: FarField::new(shape),
            origins,
            per_step,
            cursor: 0,
            weight: guess.probe.intensity(),
            numerator: ComplexGrid::zeros(object_shape.rows, object_shape.cols),
            denominator: RealGrid::zeros(object_shape.rows, object_shape.cols),
            probe: guess.probe,
            object: guess.object,
        }))
    }
}

struct LearnedContext {
    model: Arc<dyn InferenceModel>,
    dataset: Arc<DiffractionDataset>,
    far_field: FarField,
    origins: Vec<PixelPosition>,
    per_step: usize,
    cursor: usize,
    /// Probe intensity used as the stitching weight.
    weight: RealGrid,
    numerator: ComplexGrid,
    denominator: RealGrid,
    probe: Probe,
    object: Object,
}

impl LearnedContext {
    fn stitch(&mut self, origin: PixelPosition, patch: &ComplexGrid) {
        accumulate_patch(&mut self.numerator, origin, patch, &self.weight);
        let mut window = self
            .denominator
            .view_mut((origin.row, origin.col), self.weight.shape());
        window += &self.weight;
    }

    fn refresh_object(&mut self) {
        let floor = 1e-9 * self.denominator.max();
        let layer = &mut self.object.layers[0];
        for ((o, n), d) in layer
            .iter_mut()
            .zip(self.numerator.iter())
            .zip(self.denominator.iter())
        {
            if *d > floor {
                *o = *n / *d;
            }
        }
    }
}

impl EngineContext for LearnedContext {
    fn step(&mut self, iteration: usize) -> Result<StepOutput, EngineError> {
        let end = (self.cursor + self.per_step).min(self.origins.len());
        let batch = self.cursor..end;
        // Natural-order amplitudes of this batch, for the residuals below.
        let mut measured = Vec::with_capacity(batch.len());
        for index in batch.clone() {
            let centred = amplitude(&*self.dataset.frame(index)?);
            let patch = self.model.infer(&centred)?;
            if GridShape::of(&patch) != self.probe.shape() {
                return Err(EngineError::InvalidInput(format!(
                    "model returned a {} patch, expected {}",
                    GridShape::of(&patch),
                    self.probe.shape()
                )));
            }
            self.stitch(self.origins[index], &patch);
            measured.push(ifftshift(&centred));
        }
        self.cursor = end;
        self.refresh_object();

        let mut stats = ResidualStats::default();
        let shape = self.probe.shape();
        for (index, measured) in batch.clone().zip(&measured) {
            let patch = extract_patch(&self.object.layers[0], self.origins[index], shape);
            let waves: Vec<ComplexGrid> = self
                .probe
                .modes
                .iter()
                .map(|m| m.component_mul(&patch))
                .collect();
            stats = stats.merge(self.far_field.evaluate(&waves, measured));
        }
        let metrics = stats
            .metrics()
            .with(IterationMetrics::POSITIONS_PROCESSED, self.cursor as Real);
        check_divergence(iteration, &self.probe, &self.object, &metrics)?;

        Ok(StepOutput {
            update: StateUpdate {
                probe: None,
                object: (!batch.is_empty()).then(|| self.object.clone()),
                positions: None,
            },
            metrics,
            exhausted: self.cursor >= self.origins.len(),
        })
    }
}
