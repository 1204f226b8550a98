//! Backend contract shared by every reconstruction engine.
//!
//! An engine is a stateless factory ([`ReconstructionEngine`]) advertising
//! its capabilities. `initialize` binds it to a dataset and an initial
//! guess, producing an [`EngineContext`] that owns the working estimates
//! and advances them one iteration per `step` call.

use std::collections::BTreeMap;
use std::sync::Arc;

use ptychography_core::{
    DatasetError, DiffractionDataset, InitialGuess, ModelError, Object, Probe, Real, ScanPositions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::options::EngineOptions;

/// Failure while initialising or stepping an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("numerical divergence at iteration {iteration}: {detail}")]
    Divergence { iteration: usize, detail: String },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid engine input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Optional features an engine may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub position_correction: bool,
    pub multi_slice: bool,
}

/// Named scalar diagnostics for one iteration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IterationMetrics(BTreeMap<String, Real>);

impl IterationMetrics {
    pub const FOURIER_ERROR: &'static str = "fourier_error";
    pub const COST: &'static str = "cost";
    pub const POSITION_SHIFT: &'static str = "position_shift";
    pub const POSITIONS_PROCESSED: &'static str = "positions_processed";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Real) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Real) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Real> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Real)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First non-finite metric, if any.
    pub fn non_finite(&self) -> Option<(&str, Real)> {
        self.iter().find(|(_, v)| !v.is_finite())
    }
}

/// Replacement values produced by one iteration. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateUpdate {
    pub probe: Option<Probe>,
    pub object: Option<Object>,
    pub positions: Option<ScanPositions>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.probe.is_none() && self.object.is_none() && self.positions.is_none()
    }
}

/// Result of one `step`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutput {
    pub update: StateUpdate,
    pub metrics: IterationMetrics,
    /// The engine has nothing more to contribute; further steps are no-ops.
    pub exhausted: bool,
}

/// Engine factory with capability flags.
pub trait ReconstructionEngine: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> EngineCapabilities;

    fn supports_position_correction(&self) -> bool {
        self.capabilities().position_correction
    }

    fn supports_multi_slice(&self) -> bool {
        self.capabilities().multi_slice
    }

    fn initialize(
        &self,
        dataset: Arc<DiffractionDataset>,
        guess: InitialGuess,
        options: &EngineOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError>;
}

/// Per-run mutable engine state.
pub trait EngineContext: Send {
    /// Run iteration `iteration` (1-based).
    fn step(&mut self, iteration: usize) -> Result<StepOutput, EngineError>;
}

/// Reject non-finite estimates or metrics after a step.
pub(crate) fn check_divergence(
    iteration: usize,
    probe: &Probe,
    object: &Object,
    metrics: &IterationMetrics,
) -> Result<(), EngineError> {
    if let Some((name, value)) = metrics.non_finite() {
        return Err(EngineError::Divergence {
            iteration,
            detail: format!("metric '{name}' is {value}"),
        });
    }
    if !probe.is_finite() {
        return Err(EngineError::Divergence {
            iteration,
            detail: "probe contains non-finite values".into(),
        });
    }
    if !object.is_finite() {
        return Err(EngineError::Divergence {
            iteration,
            detail: "object contains non-finite values".into(),
        });
    }
    Ok(())
}

/// Check that an initial guess fits the dataset it will be run against.
pub(crate) fn check_guess(
    dataset: &DiffractionDataset,
    guess: &InitialGuess,
) -> Result<(), EngineError> {
    guess.probe.validate()?;
    guess.object.validate()?;
    guess.positions.validate()?;
    if guess.probe.shape() != dataset.frame_shape() {
        return Err(EngineError::InvalidInput(format!(
            "probe shape {} does not match frame shape {}",
            guess.probe.shape(),
            dataset.frame_shape()
        )));
    }
    if guess.positions.len() != dataset.len() {
        return Err(EngineError::InvalidInput(format!(
            "{} positions for {} frames",
            guess.positions.len(),
            dataset.len()
        )));
    }
    if guess.object.shape() != guess.geometry.shape {
        return Err(EngineError::InvalidInput(format!(
            "object shape {} does not match object geometry {}",
            guess.object.shape(),
            guess.geometry.shape
        )));
    }
    if !guess.geometry.shape.contains(guess.probe.shape()) {
        return Err(EngineError::InvalidInput(format!(
            "object {} is smaller than the probe {}",
            guess.geometry.shape,
            guess.probe.shape()
        )));
    }
    Ok(())
}
