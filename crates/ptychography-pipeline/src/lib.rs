//! Orchestration of ptychographic reconstructions.
//!
//! This crate drives the engines from `ptychography-engines` against
//! datasets from `ptychography-core`:
//!
//! - [`ReconstructionConfig`]: serde configuration with validation,
//! - [`ReconstructionState`] / [`StateReader`]: single-writer state with
//!   atomic snapshots,
//! - [`DiagnosticsSink`]: append-only iteration history with a blocking stream,
//! - [`ReconstructionSession`] and [`persistence`]: versioned, atomically
//!   written session files,
//! - [`Orchestrator`]: the configure/run/pause/resume/cancel state machine
//!   with a worker thread and background checkpoints.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptychography_core::test_utils::small_synthetic;
//! use ptychography_engines::EngineRegistry;
//! use ptychography_pipeline::{IterationBudget, Orchestrator, ReconstructionConfig, RunStatus};
//! # fn main() -> anyhow::Result<()> {
//! let dataset = Arc::new(small_synthetic().dataset);
//! let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins());
//! orchestrator.configure(
//!     dataset,
//!     ReconstructionConfig {
//!         iteration_budget: IterationBudget::Bounded(20),
//!         ..ReconstructionConfig::for_backend("epie")
//!     },
//! )?;
//! orchestrator.run()?;
//! for record in orchestrator.diagnostics().unwrap().stream() {
//!     println!("{:>4} {:?}", record.iteration, record.metrics.get("fourier_error"));
//! }
//! assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Completed);
//! # Ok(())
//! # }
//! ```

mod config;
/// Iteration history and its stream.
mod diagnostics;
mod error;
pub mod helpers;
pub mod orchestrator;
/// Atomic session files.
pub mod persistence;
pub mod session;
mod state;

pub use config::{IterationBudget, MultiSliceConfig, ReconstructionConfig};
pub use diagnostics::{DiagnosticsSink, DiagnosticsStream, IterationRecord, RecordError};
pub use error::{
    ConfigurationError, CorruptSessionError, InconsistentUpdateError, InvalidTransition,
    PersistenceError, PipelineError,
};
pub use orchestrator::{
    CheckpointRecord, Command, CompletionReason, FailureKind, Orchestrator, RunFailure,
    RunOutcome, RunStatus,
};
pub use persistence::{FileSessionStore, SessionStore, load_session, save_session};
pub use session::{
    LogEntry, ReconstructionSession, SESSION_KIND, SESSION_SCHEMA_VERSION, SessionHeader,
    SessionMetadata,
};
pub use state::{ReconstructionState, StateReader, StateSnapshot};
