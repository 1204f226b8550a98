//! Error taxonomy of the orchestration layer.

use std::io;
use std::path::PathBuf;

use ptychography_core::{DatasetError, GridShape, InitError, ModelError};
use ptychography_engines::EngineError;
use thiserror::Error;

use crate::orchestrator::{Command, RunStatus};

/// Rejected configuration; raised synchronously by `configure`.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown backend '{name}' (registered: {registered})")]
    UnknownBackend { name: String, registered: String },
    #[error("backend '{backend}' does not support position correction")]
    PositionCorrectionUnsupported { backend: String },
    #[error("backend '{backend}' does not support multi-slice objects")]
    MultiSliceUnsupported { backend: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("dataset does not match the session: {0}")]
    DatasetMismatch(String),
    #[error("initial guess: {0}")]
    Init(#[from] InitError),
    #[error("backend initialisation: {0}")]
    Engine(#[from] EngineError),
}

/// Engine update that would break the state's geometric invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InconsistentUpdateError {
    #[error("probe update has shape {actual}, state has {expected}")]
    ProbeShape { expected: GridShape, actual: GridShape },
    #[error("probe update has {actual} modes, state has {expected}")]
    ProbeModes { expected: usize, actual: usize },
    #[error("object update has shape {actual}, state has {expected}")]
    ObjectShape { expected: GridShape, actual: GridShape },
    #[error("object update has {actual} layers, state has {expected}")]
    ObjectLayers { expected: usize, actual: usize },
    #[error("position update has {actual} positions, state has {expected}")]
    PositionCount { expected: usize, actual: usize },
    #[error("invalid model in update: {0}")]
    Model(#[from] ModelError),
}

/// Session document that cannot be trusted.
#[derive(Debug, Error)]
pub enum CorruptSessionError {
    #[error("malformed session document: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("session schema version {found} is newer than supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },
    #[error("inconsistent session: {0}")]
    Inconsistent(String),
}

/// Failure while saving or loading a session.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("corrupt session {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: CorruptSessionError,
    },
    #[error("session i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing session: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Command issued in a status that does not accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {command} while {status}")]
pub struct InvalidTransition {
    pub command: Command,
    pub status: RunStatus,
}

/// Any error surfaced by the orchestration API.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    InconsistentUpdate(#[from] InconsistentUpdateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    CorruptSession(#[from] CorruptSessionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("failed to start the reconstruction worker: {0}")]
    Worker(#[source] io::Error),
}
