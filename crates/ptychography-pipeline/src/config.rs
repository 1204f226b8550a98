//! Reconstruction configuration.
//!
//! A single serde document selects the backend, bounds the run and carries
//! every engine and initial-guess knob. [`ReconstructionConfig::engine_options`]
//! and [`ReconstructionConfig::slice_layout`] translate it into the engine
//! and initialisation types.

use ptychography_core::{ObjectInitOptions, ProbeInitOptions, Real, SliceLayout};
use ptychography_engines::{EngineOptions, EpieEngine, OptimizationPlan};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// How many iterations a run may perform, counted from iteration 1 of the
/// session (restored sessions continue the count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationBudget {
    Bounded(usize),
    Unbounded,
}

impl Default for IterationBudget {
    fn default() -> Self {
        Self::Bounded(100)
    }
}

impl IterationBudget {
    /// Whether iteration `iteration` (1-based) may still run.
    pub fn allows(&self, iteration: usize) -> bool {
        match self {
            Self::Bounded(max) => iteration <= *max,
            Self::Unbounded => true,
        }
    }
}

/// Layered object request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiSliceConfig {
    pub layers: usize,
    /// Distance between consecutive layers (m).
    pub spacing_m: Real,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Registered engine name, matched case-insensitively.
    pub backend_name: String,
    pub iteration_budget: IterationBudget,
    /// Save a checkpoint every N iterations; `None` disables checkpoints.
    pub checkpoint_interval: Option<usize>,
    pub position_correction_enabled: bool,
    pub multi_slice: Option<MultiSliceConfig>,

    // Initial guess
    pub probe_init: ProbeInitOptions,
    pub object_init: ObjectInitOptions,

    // Engine knobs
    pub object_step_size: Real,
    pub probe_step_size: Real,
    pub exit_wave_relaxation: Real,
    pub object_plan: OptimizationPlan,
    pub probe_plan: OptimizationPlan,
    pub position_plan: OptimizationPlan,
    pub position_step_size: Real,
    pub position_magnitude_limit_px: Real,
    pub chunk_length: usize,
    pub memory_limit_bytes: Option<u64>,
    pub positions_per_step: Option<usize>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        let engine = EngineOptions::default();
        Self {
            backend_name: EpieEngine::NAME.to_string(),
            iteration_budget: IterationBudget::default(),
            checkpoint_interval: None,
            position_correction_enabled: false,
            multi_slice: None,
            probe_init: ProbeInitOptions::default(),
            object_init: ObjectInitOptions::default(),
            object_step_size: engine.object_step_size,
            probe_step_size: engine.probe_step_size,
            exit_wave_relaxation: engine.exit_wave_relaxation,
            object_plan: engine.object_plan,
            probe_plan: engine.probe_plan,
            position_plan: engine.position_plan,
            position_step_size: engine.position_step_size,
            position_magnitude_limit_px: engine.position_magnitude_limit_px,
            chunk_length: engine.chunk_length,
            memory_limit_bytes: engine.memory_limit_bytes,
            positions_per_step: engine.positions_per_step,
        }
    }
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), ConfigurationError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigurationError::Invalid(message()))
    }
}

impl ReconstructionConfig {
    /// Config for `backend` with every other field at its default.
    pub fn for_backend(backend: impl Into<String>) -> Self {
        Self {
            backend_name: backend.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ensure(!self.backend_name.trim().is_empty(), || {
            "backend name must not be empty".into()
        })?;
        ensure(self.iteration_budget != IterationBudget::Bounded(0), || {
            "iteration budget must be positive".into()
        })?;
        ensure(self.checkpoint_interval != Some(0), || {
            "checkpoint interval must be positive".into()
        })?;
        if let Some(slices) = self.multi_slice {
            ensure(slices.layers > 0, || "multi-slice needs at least one layer".into())?;
            ensure(
                slices.spacing_m.is_finite() && (slices.layers == 1 || slices.spacing_m > 0.0),
                || format!("invalid slice spacing {}", slices.spacing_m),
            )?;
        }
        ensure(self.probe_init.mode_power_fraction >= 0.0, || {
            format!(
                "mode power fraction {} must be non-negative",
                self.probe_init.mode_power_fraction
            )
        })?;
        self.engine_options()
            .validate()
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))
    }

    /// More than one object layer was requested.
    pub fn requires_multi_slice(&self) -> bool {
        self.multi_slice.is_some_and(|s| s.layers > 1)
    }

    pub fn slice_layout(&self) -> SliceLayout {
        match self.multi_slice {
            Some(slices) => SliceLayout {
                layers: slices.layers,
                spacing_m: slices.spacing_m,
            },
            None => SliceLayout::default(),
        }
    }

    /// Engine options for this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            object_step_size: self.object_step_size,
            probe_step_size: self.probe_step_size,
            object_plan: self.object_plan,
            probe_plan: self.probe_plan,
            position_plan: self.position_plan,
            position_correction: self.position_correction_enabled,
            position_step_size: self.position_step_size,
            position_magnitude_limit_px: self.position_magnitude_limit_px,
            exit_wave_relaxation: self.exit_wave_relaxation,
            chunk_length: self.chunk_length,
            memory_limit_bytes: self.memory_limit_bytes,
            positions_per_step: self.positions_per_step,
        }
    }
}
