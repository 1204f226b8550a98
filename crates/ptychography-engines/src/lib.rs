//! Reconstruction engines behind a common backend contract.
//!
//! Every engine implements [`ReconstructionEngine`]: it advertises its
//! capabilities and, given a dataset and an initial guess, produces an
//! [`EngineContext`] that is stepped one iteration at a time. Each step
//! returns a [`StepOutput`] with the updated estimates and named metrics;
//! the caller owns the authoritative reconstruction state.
//!
//! Built-in engines:
//!
//! - [`EpieEngine`] (`"epie"`): sequential extended PIE with multi-slice
//!   objects, incoherent probe modes and position correction.
//! - [`DifferenceMapEngine`] (`"dm"`): parallel difference map.
//! - [`LearnedEngine`] (`"ptychonn"`): single pass with a trained
//!   [`InferenceModel`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ptychography_core::{InitialGuess, ObjectInitOptions, ProbeInitOptions, SliceLayout};
//! use ptychography_core::test_utils::small_synthetic;
//! use ptychography_engines::{EngineOptions, EngineRegistry};
//!
//! let dataset = Arc::new(small_synthetic().dataset);
//! let guess = InitialGuess::build(
//!     &dataset,
//!     &ProbeInitOptions::default(),
//!     &ObjectInitOptions::default(),
//!     SliceLayout::default(),
//! )
//! .unwrap();
//! let engine = EngineRegistry::with_builtins().get("epie").unwrap();
//! let mut context = engine
//!     .initialize(dataset, guess, &EngineOptions::default())
//!     .unwrap();
//! let output = context.step(1).unwrap();
//! assert!(output.metrics.get("fourier_error").is_some());
//! ```

mod dm;
/// Backend contract: engine factories, contexts, metrics.
mod engine;
mod epie;
/// Learned single-shot inference.
mod learned;
mod options;
mod projection;
/// Free-space propagation between object slices.
pub mod propagation;
mod registry;

pub use dm::DifferenceMapEngine;
pub use engine::{
    EngineCapabilities, EngineContext, EngineError, IterationMetrics, ReconstructionEngine,
    StateUpdate, StepOutput,
};
pub use epie::EpieEngine;
pub use learned::{InferenceModel, LearnedEngine, SeparableLinearModel, SeparableLinearWeights};
pub use options::{EngineOptions, OptimizationPlan};
pub use registry::EngineRegistry;
