//! Reconstruction orchestrator.
//!
//! Owns one session at a time: [`Orchestrator::configure`] resolves the
//! backend, checks its capabilities against the configuration and builds
//! the initial guess; [`Orchestrator::run`] starts a worker thread that
//! steps the engine, applies its updates to the state, records diagnostics
//! and hands checkpoints to a writer thread. `pause`, `resume` and `cancel`
//! are observed between iterations; an in-flight step always finishes.
//!
//! Observers follow progress through [`Orchestrator::status`], the
//! [`StateReader`] from [`Orchestrator::reader`] and the diagnostics
//! stream, or block with [`Orchestrator::wait_until`].

mod checkpoint;
mod control;
mod status;
mod worker;

pub use checkpoint::CheckpointRecord;
pub use status::{Command, CompletionReason, FailureKind, RunFailure, RunOutcome, RunStatus};

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};
use ptychography_core::{DiffractionDataset, InitialGuess};
use ptychography_engines::{EngineContext, EngineRegistry, ReconstructionEngine};

use crate::config::ReconstructionConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::error::{ConfigurationError, InvalidTransition, PipelineError};
use crate::persistence::SessionStore;
use crate::session::{
    LogEntry, ReconstructionSession, SESSION_KIND, SESSION_SCHEMA_VERSION, SessionHeader,
    SessionMetadata,
};
use crate::state::{ReconstructionState, StateReader, StateSnapshot};
use checkpoint::CheckpointWriter;
use control::Control;
use worker::Worker;

/// Everything that belongs to the configured session.
struct Configured {
    header: SessionHeader,
    reader: StateReader,
    diagnostics: Arc<DiagnosticsSink>,
    /// Pairs each state update with its iteration record.
    publish: Arc<Mutex<()>>,
    checkpoints: Arc<Mutex<Vec<CheckpointRecord>>>,
    log: Arc<Mutex<Vec<LogEntry>>>,
    /// Taken by `run`.
    pending: Option<(Box<dyn EngineContext>, ReconstructionState)>,
    worker: Option<JoinHandle<()>>,
}

/// Drives one reconstruction session at a time.
///
/// Commands are synchronous and cheap: they validate the transition and
/// signal the worker, which acts on them at the next iteration boundary.
/// Dropping the orchestrator cancels an active run and joins its worker.
pub struct Orchestrator {
    registry: EngineRegistry,
    store: Option<Arc<dyn SessionStore>>,
    control: Arc<Control>,
    session: Option<Configured>,
}

impl Orchestrator {
    /// Idle orchestrator resolving backends through `registry`.
    ///
    /// Without [`with_session_store`](Self::with_session_store) configured
    /// checkpoint intervals are ignored with a warning.
    pub fn new(registry: EngineRegistry) -> Self {
        Self {
            registry,
            store: None,
            control: Arc::new(Control::new()),
            session: None,
        }
    }

    /// Store used for periodic checkpoints.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Backends available to [`configure`](Self::configure).
    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────

    /// Start a new session on `dataset`. Accepted from `Idle`, `Configuring`
    /// and terminal states; on error the status is unchanged.
    pub fn configure(
        &mut self,
        dataset: Arc<DiffractionDataset>,
        config: ReconstructionConfig,
    ) -> Result<(), PipelineError> {
        self.check_configurable()?;
        let engine = self.resolve_engine(&config)?;
        let guess = InitialGuess::build(
            &dataset,
            &config.probe_init,
            &config.object_init,
            config.slice_layout(),
        )
        .map_err(ConfigurationError::from)?;
        let snapshot = StateSnapshot::initial(&guess);
        let header = SessionHeader {
            metadata: SessionMetadata::new(SESSION_KIND, SESSION_SCHEMA_VERSION),
            dataset: dataset.summary(),
            geometry: guess.geometry,
            config,
        };
        let context = engine
            .initialize(dataset, guess, &header.config.engine_options())
            .map_err(ConfigurationError::from)?;

        info!(
            "configured '{}' on {} frames of {}",
            engine.name(),
            header.dataset.frame_count,
            header.dataset.metadata.frame_shape
        );
        let log = vec![LogEntry::success_with_notes(
            "configure",
            format!("backend {}", engine.name()),
        )];
        self.install(header, snapshot, Vec::new(), log, context);
        Ok(())
    }

    /// Resume a persisted session on the dataset it was computed from.
    ///
    /// Probe, object, positions, history and configuration are restored;
    /// the next iteration continues the session's count. Engine-internal
    /// working buffers start afresh.
    pub fn configure_from_session(
        &mut self,
        dataset: Arc<DiffractionDataset>,
        session: ReconstructionSession,
    ) -> Result<(), PipelineError> {
        self.check_configurable()?;
        session.validate()?;
        if let Some(reason) = session.dataset.mismatch(&dataset) {
            return Err(ConfigurationError::DatasetMismatch(reason).into());
        }
        let engine = self.resolve_engine(&session.config)?;
        let guess = InitialGuess {
            probe: session.state.probe.clone(),
            object: session.state.object.clone(),
            positions: session.state.positions.clone(),
            geometry: session.geometry,
        };
        let context = engine
            .initialize(dataset, guess, &session.config.engine_options())
            .map_err(ConfigurationError::from)?;

        info!(
            "restored session at iteration {} with backend '{}'",
            session.iteration(),
            engine.name()
        );
        let header = session.header();
        let mut log = session.log;
        log.push(LogEntry::success_with_notes(
            "restore",
            format!("iteration {}", session.state.iteration),
        ));
        self.install(header, session.state, session.history, log, context);
        Ok(())
    }

    fn check_configurable(&mut self) -> Result<(), PipelineError> {
        let status = self.control.status();
        if status.is_active() {
            return Err(InvalidTransition {
                command: Command::Configure,
                status,
            }
            .into());
        }
        Ok(())
    }

    fn resolve_engine(
        &self,
        config: &ReconstructionConfig,
    ) -> Result<Arc<dyn ReconstructionEngine>, ConfigurationError> {
        config.validate()?;
        let engine = self.registry.get(&config.backend_name).ok_or_else(|| {
            ConfigurationError::UnknownBackend {
                name: config.backend_name.clone(),
                registered: self.registry.names().join(", "),
            }
        })?;
        if config.position_correction_enabled && !engine.supports_position_correction() {
            return Err(ConfigurationError::PositionCorrectionUnsupported {
                backend: engine.name().to_string(),
            });
        }
        if config.requires_multi_slice() && !engine.supports_multi_slice() {
            return Err(ConfigurationError::MultiSliceUnsupported {
                backend: engine.name().to_string(),
            });
        }
        Ok(engine)
    }

    fn install(
        &mut self,
        header: SessionHeader,
        snapshot: StateSnapshot,
        history: Vec<crate::diagnostics::IterationRecord>,
        log: Vec<LogEntry>,
        context: Box<dyn EngineContext>,
    ) {
        self.join_worker();
        let state = ReconstructionState::new(snapshot);
        self.session = Some(Configured {
            header,
            reader: state.reader(),
            diagnostics: Arc::new(DiagnosticsSink::with_history(history)),
            publish: Arc::new(Mutex::new(())),
            checkpoints: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(Mutex::new(log)),
            pending: Some((context, state)),
            worker: None,
        });
        self.control.reset(RunStatus::Configuring);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────

    /// Start iterating on a worker thread. Only valid right after `configure`.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        let status = self.control.status();
        let invalid = InvalidTransition {
            command: Command::Run,
            status,
        };
        if status != RunStatus::Configuring {
            return Err(invalid.into());
        }
        let Some(session) = self.session.as_mut() else {
            return Err(invalid.into());
        };
        let Some((context, state)) = session.pending.take() else {
            return Err(invalid.into());
        };

        let config = &session.header.config;
        let checkpoints = match (&self.store, config.checkpoint_interval) {
            (Some(store), Some(_)) => Some(
                CheckpointWriter::spawn(
                    Arc::clone(store),
                    Arc::clone(&session.checkpoints),
                    Arc::clone(&session.log),
                )
                .map_err(PipelineError::Worker)?,
            ),
            (None, Some(every)) => {
                warn!("checkpoint interval {every} set but no session store; checkpoints disabled");
                None
            }
            _ => None,
        };
        let worker = Worker {
            context,
            state,
            budget: config.iteration_budget,
            checkpoint_interval: config.checkpoint_interval,
            checkpoints,
            diagnostics: Arc::clone(&session.diagnostics),
            publish: Arc::clone(&session.publish),
            control: Arc::clone(&self.control),
            header: session.header.clone(),
            log: Arc::clone(&session.log),
        };

        self.control.reset(RunStatus::Running);
        let handle = thread::Builder::new()
            .name("ptycho-worker".into())
            .spawn(move || worker.run());
        match handle {
            Ok(handle) => {
                session.worker = Some(handle);
                info!("reconstruction started");
                Ok(())
            }
            Err(e) => {
                self.control.finish(RunOutcome::Failed {
                    failure: RunFailure {
                        kind: FailureKind::Backend,
                        iteration: session.reader.iteration() + 1,
                        message: format!("worker could not start: {e}"),
                    },
                });
                Err(PipelineError::Worker(e))
            }
        }
    }

    /// Request a pause at the next iteration boundary. No-op when paused.
    pub fn pause(&self) -> Result<(), PipelineError> {
        let mut state = self.control.lock();
        match state.status {
            RunStatus::Running => {
                state.pause_requested = true;
                Ok(())
            }
            RunStatus::Paused => Ok(()),
            status => Err(InvalidTransition {
                command: Command::Pause,
                status,
            }
            .into()),
        }
    }

    /// Continue a paused run, or withdraw a pause that has not taken effect.
    pub fn resume(&self) -> Result<(), PipelineError> {
        let mut state = self.control.lock();
        match state.status {
            RunStatus::Paused | RunStatus::Running => {
                state.pause_requested = false;
                if state.status == RunStatus::Paused {
                    state.status = RunStatus::Running;
                }
                drop(state);
                self.control.notify();
                Ok(())
            }
            status => Err(InvalidTransition {
                command: Command::Resume,
                status,
            }
            .into()),
        }
    }

    /// Stop the session for good. Takes effect at the next iteration
    /// boundary; repeated calls and calls on a finished session are no-ops.
    pub fn cancel(&self) -> Result<(), PipelineError> {
        let mut state = self.control.lock();
        match state.status {
            RunStatus::Idle => Err(InvalidTransition {
                command: Command::Cancel,
                status: RunStatus::Idle,
            }
            .into()),
            RunStatus::Configuring => {
                drop(state);
                self.control.finish(RunOutcome::Cancelled);
                Ok(())
            }
            RunStatus::Running | RunStatus::Paused => {
                state.cancel_requested = true;
                drop(state);
                self.control.notify();
                Ok(())
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => Ok(()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────────────

    /// Current lifecycle status.
    pub fn status(&self) -> RunStatus {
        self.control.status()
    }

    /// Cause of the terminal status, once reached.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.control.outcome()
    }

    /// The failure that ended the run, if it ended in `Failed`.
    pub fn failure(&self) -> Option<RunFailure> {
        self.outcome().and_then(|o| o.failure().cloned())
    }

    /// Read handle on the session state; stays valid after the run ends.
    ///
    /// `None` until a session is configured.
    pub fn reader(&self) -> Option<StateReader> {
        self.session.as_ref().map(|s| s.reader.clone())
    }

    /// Latest consistent state of the configured session.
    pub fn snapshot(&self) -> Option<Arc<StateSnapshot>> {
        self.session.as_ref().map(|s| s.reader.snapshot())
    }

    /// Iteration history of the configured session.
    ///
    /// Streams from the sink block while the run is active and end once it
    /// is terminal. A restored session starts with its persisted history.
    pub fn diagnostics(&self) -> Option<Arc<DiagnosticsSink>> {
        self.session.as_ref().map(|s| Arc::clone(&s.diagnostics))
    }

    /// Checkpoints written so far in this session.
    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.session
            .as_ref()
            .map(|s| {
                s.checkpoints
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .unwrap_or_default()
    }

    /// Point-in-time session for explicit save.
    ///
    /// State and history are read together, so the history never runs
    /// ahead of the stored state even while the worker is iterating.
    pub fn session(&self) -> Option<ReconstructionSession> {
        let configured = self.session.as_ref()?;
        // Outcome first: once it is set, state and history are final.
        let (status, outcome) = {
            let control = self.control.lock();
            (control.status, control.outcome.clone())
        };
        let (state, history) = {
            let _published = configured
                .publish
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (
                (*configured.reader.snapshot()).clone(),
                configured.diagnostics.records(),
            )
        };
        let log = configured
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Some(ReconstructionSession::assemble(
            &configured.header,
            state,
            history,
            status,
            outcome,
            log,
        ))
    }

    /// Block until the run reaches a terminal status.
    ///
    /// Returns immediately with the current status when no run is active.
    pub fn wait_for_terminal(&self) -> RunStatus {
        let status = self.status();
        if !status.is_active() {
            return status;
        }
        self.control
            .wait_until(|s| !s.is_active(), None)
            .unwrap_or(status)
    }

    /// Block until `predicate` holds for the status or `timeout` elapses.
    pub fn wait_until(
        &self,
        predicate: impl Fn(RunStatus) -> bool,
        timeout: Option<Duration>,
    ) -> Option<RunStatus> {
        self.control.wait_until(predicate, timeout)
    }

    fn join_worker(&mut self) {
        let Some(handle) = self.session.as_mut().and_then(|s| s.worker.take()) else {
            return;
        };
        if handle.join().is_err() {
            warn!("reconstruction worker panicked");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.status().is_active() {
            let _ = self.cancel();
        }
        self.join_worker();
    }
}
