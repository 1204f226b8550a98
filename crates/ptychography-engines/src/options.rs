//! Engine tuning knobs.

use ptychography_core::Real;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Iteration window `{start, stop, stride}` in which a parameter is updated.
///
/// Iterations are 1-based; `stop` is exclusive and `None` means "forever".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationPlan {
    pub start: usize,
    pub stop: Option<usize>,
    pub stride: usize,
}

impl Default for OptimizationPlan {
    fn default() -> Self {
        Self::ALWAYS
    }
}

impl OptimizationPlan {
    pub const ALWAYS: Self = Self {
        start: 0,
        stop: None,
        stride: 1,
    };

    pub const NEVER: Self = Self {
        start: 0,
        stop: Some(0),
        stride: 1,
    };

    pub fn starting_at(start: usize) -> Self {
        Self {
            start,
            ..Self::ALWAYS
        }
    }

    pub fn is_active(&self, iteration: usize) -> bool {
        if self.stride == 0 || iteration < self.start {
            return false;
        }
        if self.stop.is_some_and(|stop| iteration >= stop) {
            return false;
        }
        (iteration - self.start) % self.stride == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Object update step size (ePIE α).
    pub object_step_size: Real,
    /// Probe update step size (ePIE β).
    pub probe_step_size: Real,
    pub object_plan: OptimizationPlan,
    pub probe_plan: OptimizationPlan,
    pub position_plan: OptimizationPlan,
    pub position_correction: bool,
    /// Gain applied to the least-squares position shift estimate.
    pub position_step_size: Real,
    /// Largest shift applied to one position in one iteration, in object pixels.
    pub position_magnitude_limit_px: Real,
    /// Difference-map exit-wave relaxation.
    pub exit_wave_relaxation: Real,
    /// Positions per parallel batch (difference map).
    pub chunk_length: usize,
    /// Upper bound on engine working memory.
    pub memory_limit_bytes: Option<u64>,
    /// Positions consumed per step (learned engine); `None` means all.
    pub positions_per_step: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            object_step_size: 1.0,
            probe_step_size: 1.0,
            object_plan: OptimizationPlan::ALWAYS,
            probe_plan: OptimizationPlan::ALWAYS,
            position_plan: OptimizationPlan::ALWAYS,
            position_correction: false,
            position_step_size: 1.0,
            position_magnitude_limit_px: 1.0,
            exit_wave_relaxation: 1.0,
            chunk_length: 16,
            memory_limit_bytes: None,
            positions_per_step: None,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), EngineError> {
        let in_unit = |v: Real| v.is_finite() && v > 0.0 && v <= 1.0;
        if !in_unit(self.object_step_size) || !in_unit(self.probe_step_size) {
            return Err(EngineError::InvalidInput(format!(
                "step sizes must lie in (0, 1], got object {} probe {}",
                self.object_step_size, self.probe_step_size
            )));
        }
        if !in_unit(self.exit_wave_relaxation) {
            return Err(EngineError::InvalidInput(format!(
                "exit wave relaxation must lie in (0, 1], got {}",
                self.exit_wave_relaxation
            )));
        }
        if !(self.position_step_size.is_finite() && self.position_step_size > 0.0) {
            return Err(EngineError::InvalidInput(format!(
                "position step size {}",
                self.position_step_size
            )));
        }
        if !(self.position_magnitude_limit_px.is_finite() && self.position_magnitude_limit_px >= 0.0)
        {
            return Err(EngineError::InvalidInput(format!(
                "position magnitude limit {}",
                self.position_magnitude_limit_px
            )));
        }
        if self.chunk_length == 0 {
            return Err(EngineError::InvalidInput("chunk length must be positive".into()));
        }
        if self.positions_per_step == Some(0) {
            return Err(EngineError::InvalidInput(
                "positions per step must be positive".into(),
            ));
        }
        Ok(())
    }
}
