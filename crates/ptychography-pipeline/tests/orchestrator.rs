//! Orchestrator state machine, failure policy and checkpointing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use ptychography_core::synthetic::SyntheticScan;
use ptychography_core::test_utils::small_synthetic;
use ptychography_core::{Complex64, DiffractionDataset, GridShape, InitialGuess, Object};
use ptychography_engines::{
    DifferenceMapEngine, EngineCapabilities, EngineContext, EngineError, EngineOptions,
    EngineRegistry, IterationMetrics, LearnedEngine, ReconstructionEngine, SeparableLinearModel,
    StateUpdate, StepOutput,
};
use ptychography_pipeline::{
    CompletionReason, ConfigurationError, FailureKind, FileSessionStore, IterationBudget,
    MultiSliceConfig, Orchestrator, PersistenceError, PipelineError, ReconstructionConfig,
    ReconstructionSession, RunOutcome, RunStatus, SessionStore, load_session, save_session,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(60));

/// Engine with scripted behaviour: shrinks the object a little every step.
#[derive(Debug, Clone, Default)]
struct ScriptedEngine {
    fail_at: Option<usize>,
    delay: Duration,
}

impl ScriptedEngine {
    const NAME: &'static str = "scripted";
}

struct ScriptedContext {
    script: ScriptedEngine,
    object: Object,
}

fn shrink(object: &mut Object) {
    for z in object.layers[0].iter_mut() {
        *z *= Complex64::new(0.99, 0.0);
    }
}

impl ReconstructionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    fn initialize(
        &self,
        _dataset: Arc<DiffractionDataset>,
        guess: InitialGuess,
        _options: &EngineOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        Ok(Box::new(ScriptedContext {
            script: self.clone(),
            object: guess.object,
        }))
    }
}

impl EngineContext for ScriptedContext {
    fn step(&mut self, iteration: usize) -> Result<StepOutput, EngineError> {
        thread::sleep(self.script.delay);
        if self.script.fail_at == Some(iteration) {
            return Err(EngineError::Divergence {
                iteration,
                detail: "object amplitude blew up".into(),
            });
        }
        shrink(&mut self.object);
        Ok(StepOutput {
            update: StateUpdate {
                object: Some(self.object.clone()),
                ..StateUpdate::default()
            },
            metrics: IterationMetrics::new()
                .with(IterationMetrics::FOURIER_ERROR, 1.0 / iteration as f64),
            exhausted: false,
        })
    }
}

fn registry_with(engine: ScriptedEngine) -> EngineRegistry {
    let mut registry = EngineRegistry::with_builtins();
    registry.register(Arc::new(engine));
    registry
}

fn scripted_config(budget: IterationBudget) -> ReconstructionConfig {
    ReconstructionConfig {
        iteration_budget: budget,
        ..ReconstructionConfig::for_backend(ScriptedEngine::NAME)
    }
}

fn small_dataset() -> Arc<DiffractionDataset> {
    Arc::new(small_synthetic().dataset)
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    files.retain(|p| p.extension().is_some_and(|e| e == "json"));
    files.sort();
    Ok(files)
}

#[test]
fn idle_accepts_only_configure() {
    let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins());
    assert_eq!(orchestrator.status(), RunStatus::Idle);
    assert!(matches!(orchestrator.run(), Err(PipelineError::Transition(_))));
    assert!(matches!(orchestrator.pause(), Err(PipelineError::Transition(_))));
    assert!(matches!(orchestrator.resume(), Err(PipelineError::Transition(_))));
    assert!(matches!(orchestrator.cancel(), Err(PipelineError::Transition(_))));
    assert_eq!(orchestrator.status(), RunStatus::Idle);
    assert!(orchestrator.session().is_none());
}

#[test]
fn classical_run_completes_budget_with_periodic_checkpoints() -> Result<()> {
    let scan = SyntheticScan {
        frame_shape: GridShape::square(128),
        scan_rows: 10,
        scan_cols: 10,
        step_px: 32.0,
        ..SyntheticScan::default()
    };
    let dataset = Arc::new(scan.simulate()?.dataset);
    assert_eq!(dataset.len(), 100);

    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileSessionStore::new(dir.path()));
    let mut orchestrator =
        Orchestrator::new(EngineRegistry::with_builtins()).with_session_store(store);
    orchestrator.configure(
        dataset,
        ReconstructionConfig {
            iteration_budget: IterationBudget::Bounded(50),
            checkpoint_interval: Some(10),
            ..ReconstructionConfig::for_backend("epie")
        },
    )?;
    orchestrator.run()?;

    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Completed);
    assert_eq!(
        orchestrator.outcome(),
        Some(RunOutcome::Completed {
            reason: CompletionReason::BudgetReached
        })
    );

    let records = orchestrator
        .diagnostics()
        .ok_or_else(|| anyhow!("no diagnostics"))?
        .records();
    assert_eq!(records.len(), 50);
    let iterations: Vec<usize> = records.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, (1..=50).collect::<Vec<_>>());
    assert!(records.windows(2).all(|w| w[1].elapsed_s >= w[0].elapsed_s));

    let checkpoints = orchestrator.checkpoints();
    let saved: Vec<usize> = checkpoints.iter().map(|c| c.iteration).collect();
    assert_eq!(saved, vec![10, 20, 30, 40, 50]);
    assert_eq!(json_files(dir.path())?.len(), 5);

    let last = load_session(&checkpoints[4].location)?;
    assert_eq!(last.iteration(), 50);
    assert_eq!(last.history.len(), 50);
    assert_eq!(
        orchestrator.snapshot().map(|s| s.iteration),
        Some(50)
    );
    Ok(())
}

#[test]
fn unsupported_capabilities_fail_configuration() {
    let dataset = small_dataset();
    let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins());

    let err = orchestrator
        .configure(
            Arc::clone(&dataset),
            ReconstructionConfig {
                position_correction_enabled: true,
                ..ReconstructionConfig::for_backend(DifferenceMapEngine::NAME)
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigurationError::PositionCorrectionUnsupported { .. })
    ));
    assert_eq!(orchestrator.status(), RunStatus::Idle);
    assert!(orchestrator.diagnostics().is_none());

    let err = orchestrator
        .configure(
            Arc::clone(&dataset),
            ReconstructionConfig {
                multi_slice: Some(MultiSliceConfig {
                    layers: 2,
                    spacing_m: 1e-6,
                }),
                ..ReconstructionConfig::for_backend("DM")
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigurationError::MultiSliceUnsupported { .. })
    ));

    let err = orchestrator
        .configure(dataset, ReconstructionConfig::for_backend("mystery"))
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigurationError::UnknownBackend { .. })
    ));
    assert_eq!(orchestrator.status(), RunStatus::Idle);
}

#[test]
fn divergence_fails_and_keeps_last_consistent_state() -> Result<()> {
    let engine = ScriptedEngine {
        fail_at: Some(3),
        ..ScriptedEngine::default()
    };
    let mut orchestrator = Orchestrator::new(registry_with(engine));
    orchestrator.configure(small_dataset(), scripted_config(IterationBudget::Bounded(10)))?;
    let initial = orchestrator
        .snapshot()
        .ok_or_else(|| anyhow!("not configured"))?;
    orchestrator.run()?;

    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Failed);
    let failure = orchestrator
        .failure()
        .ok_or_else(|| anyhow!("no failure recorded"))?;
    assert_eq!(failure.kind, FailureKind::Backend);
    assert_eq!(failure.iteration, 3);
    assert!(failure.message.contains("blew up"));

    let diagnostics = orchestrator
        .diagnostics()
        .ok_or_else(|| anyhow!("no diagnostics"))?;
    assert_eq!(diagnostics.len(), 2);
    assert!(diagnostics.is_closed());

    let mut expected = initial.object.clone();
    shrink(&mut expected);
    shrink(&mut expected);
    let last = orchestrator
        .snapshot()
        .ok_or_else(|| anyhow!("no state"))?;
    assert_eq!(last.iteration, 2);
    assert_eq!(last.object, expected);
    assert_eq!(last.probe, initial.probe);

    let session = orchestrator
        .session()
        .ok_or_else(|| anyhow!("no session"))?;
    assert_eq!(session.status, RunStatus::Failed);
    assert_eq!(session.history.len(), 2);
    assert!(session.log.iter().any(|e| e.operation == "run" && !e.success));

    // Failed runs are never retried.
    assert!(matches!(orchestrator.run(), Err(PipelineError::Transition(_))));
    Ok(())
}

#[test]
fn pause_resume_and_cancel_take_effect_between_iterations() -> Result<()> {
    let engine = ScriptedEngine {
        delay: Duration::from_millis(5),
        ..ScriptedEngine::default()
    };
    let mut orchestrator = Orchestrator::new(registry_with(engine));
    orchestrator.configure(small_dataset(), scripted_config(IterationBudget::Unbounded))?;
    let diagnostics = orchestrator
        .diagnostics()
        .ok_or_else(|| anyhow!("no diagnostics"))?;
    orchestrator.run()?;

    let mut stream = diagnostics.stream();
    stream
        .next_timeout(Duration::from_secs(10))
        .ok_or_else(|| anyhow!("no first iteration"))?;

    orchestrator.pause()?;
    assert_eq!(
        orchestrator.wait_until(|s| s == RunStatus::Paused, WAIT),
        Some(RunStatus::Paused)
    );
    orchestrator.pause()?;
    let paused_at = diagnostics.len();
    thread::sleep(Duration::from_millis(40));
    assert_eq!(diagnostics.len(), paused_at);
    assert_eq!(
        orchestrator.reader().map(|r| r.iteration()),
        Some(paused_at)
    );

    orchestrator.resume()?;
    assert_eq!(orchestrator.status(), RunStatus::Running);
    let mut resumed = false;
    for _ in 0..1000 {
        if diagnostics.len() > paused_at {
            resumed = true;
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(resumed, "run did not resume");

    orchestrator.cancel()?;
    orchestrator.cancel()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Cancelled);
    assert_eq!(orchestrator.outcome(), Some(RunOutcome::Cancelled));
    orchestrator.cancel()?;
    assert_eq!(orchestrator.status(), RunStatus::Cancelled);

    let final_len = diagnostics.len();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(diagnostics.len(), final_len);
    assert!(matches!(orchestrator.resume(), Err(PipelineError::Transition(_))));
    assert!(matches!(orchestrator.run(), Err(PipelineError::Transition(_))));
    Ok(())
}

#[test]
fn cancel_while_paused_never_resumes() -> Result<()> {
    let engine = ScriptedEngine {
        delay: Duration::from_millis(2),
        ..ScriptedEngine::default()
    };
    let mut orchestrator = Orchestrator::new(registry_with(engine));
    orchestrator.configure(small_dataset(), scripted_config(IterationBudget::Unbounded))?;
    orchestrator.run()?;
    orchestrator.pause()?;
    orchestrator.wait_until(|s| s == RunStatus::Paused, WAIT);
    let paused_at = orchestrator.reader().map(|r| r.iteration());

    orchestrator.cancel()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Cancelled);
    assert_eq!(orchestrator.reader().map(|r| r.iteration()), paused_at);
    Ok(())
}

#[test]
fn cancel_before_run_is_immediate() -> Result<()> {
    let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins());
    orchestrator.configure(small_dataset(), ReconstructionConfig::default())?;
    assert_eq!(orchestrator.status(), RunStatus::Configuring);
    orchestrator.cancel()?;
    assert_eq!(orchestrator.status(), RunStatus::Cancelled);
    assert!(matches!(orchestrator.run(), Err(PipelineError::Transition(_))));

    // A terminal orchestrator accepts a new configuration.
    orchestrator.configure(small_dataset(), ReconstructionConfig::default())?;
    assert_eq!(orchestrator.status(), RunStatus::Configuring);
    assert_eq!(orchestrator.outcome(), None);
    Ok(())
}

#[test]
fn concurrent_snapshots_are_always_consistent() -> Result<()> {
    let dataset = small_dataset();
    let frame_shape = dataset.frame_shape();
    let frames = dataset.len();
    let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins());
    orchestrator.configure(
        dataset,
        ReconstructionConfig {
            iteration_budget: IterationBudget::Bounded(15),
            position_correction_enabled: true,
            ..ReconstructionConfig::for_backend("epie")
        },
    )?;
    let reader = orchestrator
        .reader()
        .ok_or_else(|| anyhow!("not configured"))?;
    let object_shape = reader.snapshot().object.shape();

    let done = Arc::new(AtomicBool::new(false));
    let observer = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = 0;
            let mut seen = 0;
            while !done.load(Ordering::Acquire) {
                let snapshot = reader.snapshot();
                assert!(snapshot.iteration >= last);
                assert_eq!(snapshot.probe.shape(), frame_shape);
                assert_eq!(snapshot.object.shape(), object_shape);
                assert_eq!(snapshot.positions.len(), frames);
                last = snapshot.iteration;
                seen += 1;
            }
            seen
        })
    };

    orchestrator.run()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Completed);
    done.store(true, Ordering::Release);
    let seen = observer.join().map_err(|_| anyhow!("observer panicked"))?;
    assert!(seen > 0);
    Ok(())
}

#[test]
fn explicit_saves_during_a_run_load_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("explicit.json");
    let mut orchestrator = Orchestrator::new(registry_with(ScriptedEngine::default()));
    orchestrator.configure(small_dataset(), scripted_config(IterationBudget::Unbounded))?;
    orchestrator.run()?;

    let mut saved = 0;
    while saved < 200 {
        let session = orchestrator
            .session()
            .ok_or_else(|| anyhow!("not configured"))?;
        assert_eq!(session.status, RunStatus::Running);
        session.validate()?;
        // A fresh run records every applied iteration.
        assert_eq!(session.history.len(), session.iteration());
        save_session(&path, &session)?;
        let loaded = load_session(&path)?;
        assert_eq!(loaded.iteration(), session.iteration());
        assert_eq!(loaded.history, session.history);
        saved += 1;
    }

    orchestrator.cancel()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Cancelled);
    let last = orchestrator
        .session()
        .ok_or_else(|| anyhow!("not configured"))?;
    assert_eq!(last.history.len(), last.iteration());
    Ok(())
}

#[test]
fn restored_session_continues_iteration_count() -> Result<()> {
    let dataset = small_dataset();
    let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins());
    orchestrator.configure(
        Arc::clone(&dataset),
        ReconstructionConfig {
            iteration_budget: IterationBudget::Bounded(4),
            ..ReconstructionConfig::for_backend("epie")
        },
    )?;
    orchestrator.run()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Completed);
    let session = orchestrator
        .session()
        .ok_or_else(|| anyhow!("no session"))?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scan.json");
    save_session(&path, &session)?;
    let mut restored = load_session(&path)?;
    assert_eq!(restored, session);

    restored.config.iteration_budget = IterationBudget::Bounded(7);
    orchestrator.configure_from_session(Arc::clone(&dataset), restored)?;
    assert_eq!(orchestrator.reader().map(|r| r.iteration()), Some(4));
    orchestrator.run()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Completed);

    let resumed = orchestrator
        .session()
        .ok_or_else(|| anyhow!("no session"))?;
    assert_eq!(resumed.iteration(), 7);
    let iterations: Vec<usize> = resumed.history.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, (1..=7).collect::<Vec<_>>());
    assert!(resumed.history[4].elapsed_s >= resumed.history[3].elapsed_s);
    assert!(resumed.log.iter().any(|e| e.operation == "restore"));
    Ok(())
}

#[test]
fn restore_rejects_a_different_dataset() -> Result<()> {
    let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins());
    orchestrator.configure(small_dataset(), ReconstructionConfig::default())?;
    let session = orchestrator
        .session()
        .ok_or_else(|| anyhow!("no session"))?;

    let other = SyntheticScan {
        scan_rows: 3,
        ..ptychography_core::test_utils::small_scan()
    }
    .simulate()?;
    let err = orchestrator
        .configure_from_session(Arc::new(other.dataset), session)
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigurationError::DatasetMismatch(_))
    ));
    assert_eq!(orchestrator.status(), RunStatus::Configuring);
    Ok(())
}

#[test]
fn learned_engine_completes_before_budget() -> Result<()> {
    let dataset = small_dataset();
    let model = SeparableLinearModel::constant(dataset.frame_shape(), 1.0, 0.0);
    let mut registry = EngineRegistry::with_builtins();
    registry.register(Arc::new(LearnedEngine::new(Arc::new(model))));
    let mut orchestrator = Orchestrator::new(registry);
    orchestrator.configure(
        dataset,
        ReconstructionConfig {
            iteration_budget: IterationBudget::Bounded(100),
            positions_per_step: Some(4),
            ..ReconstructionConfig::for_backend(LearnedEngine::NAME)
        },
    )?;
    orchestrator.run()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Completed);
    assert_eq!(
        orchestrator.outcome(),
        Some(RunOutcome::Completed {
            reason: CompletionReason::EngineExhausted
        })
    );
    assert_eq!(orchestrator.diagnostics().map(|d| d.len()), Some(4));
    Ok(())
}

/// Store whose disk is always full.
struct FullDisk;

impl SessionStore for FullDisk {
    fn save(&self, session: &ReconstructionSession) -> Result<PathBuf, PersistenceError> {
        Err(PersistenceError::Io {
            path: PathBuf::from(format!("/full/{}.json", session.iteration())),
            source: std::io::Error::other("no space left on device"),
        })
    }

    fn load(&self, location: &Path) -> Result<ReconstructionSession, PersistenceError> {
        Err(PersistenceError::Io {
            path: location.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

#[test]
fn checkpoint_failures_are_logged_but_not_fatal() -> Result<()> {
    let mut orchestrator =
        Orchestrator::new(registry_with(ScriptedEngine::default())).with_session_store(Arc::new(FullDisk));
    orchestrator.configure(
        small_dataset(),
        ReconstructionConfig {
            checkpoint_interval: Some(2),
            ..scripted_config(IterationBudget::Bounded(4))
        },
    )?;
    orchestrator.run()?;
    assert_eq!(orchestrator.wait_for_terminal(), RunStatus::Completed);
    assert!(orchestrator.checkpoints().is_empty());

    let session = orchestrator
        .session()
        .ok_or_else(|| anyhow!("no session"))?;
    let failures = session
        .log
        .iter()
        .filter(|e| e.operation == "checkpoint" && !e.success)
        .count();
    assert_eq!(failures, 2);
    Ok(())
}
