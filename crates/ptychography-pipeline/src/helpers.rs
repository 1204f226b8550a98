//! Blocking one-call workflows on top of the orchestrator.
//!
//! Useful for scripts and batch jobs that do not need to observe or steer a
//! run while it progresses.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptychography_core::{DatasetStore, SourceDescriptor};
//! use ptychography_pipeline::{ReconstructionConfig, helpers::reconstruct};
//! # fn main() -> anyhow::Result<()> {
//! let store = DatasetStore::with_default_readers();
//! let dataset = store.load(&SourceDescriptor::new("/data/scan-0042.json", "raw"))?;
//! let session = reconstruct(dataset, ReconstructionConfig::default())?;
//! println!("{} iterations, {:?}", session.iteration(), session.outcome);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use ptychography_core::DiffractionDataset;
use ptychography_engines::EngineRegistry;

use crate::config::ReconstructionConfig;
use crate::orchestrator::{Orchestrator, RunStatus};
use crate::persistence::{load_session, save_session};
use crate::session::ReconstructionSession;

/// Run the built-in engines to a terminal status and return the session.
///
/// Fails if the run ends in `Failed`; the error names the failing iteration.
pub fn reconstruct(
    dataset: Arc<DiffractionDataset>,
    config: ReconstructionConfig,
) -> Result<ReconstructionSession> {
    run_with(Orchestrator::new(EngineRegistry::with_builtins()), |o| {
        o.configure(dataset, config)
    })
}

/// Continue the session saved at `path` until its configured budget and
/// write the result back to the same file.
pub fn resume_from_file(
    dataset: Arc<DiffractionDataset>,
    path: &Path,
    registry: EngineRegistry,
) -> Result<ReconstructionSession> {
    let session = load_session(path)
        .with_context(|| format!("failed to load session {}", path.display()))?;
    let session = run_with(Orchestrator::new(registry), |o| {
        o.configure_from_session(dataset, session)
    })?;
    save_session(path, &session)
        .with_context(|| format!("failed to save session {}", path.display()))?;
    Ok(session)
}

fn run_with(
    mut orchestrator: Orchestrator,
    configure: impl FnOnce(&mut Orchestrator) -> Result<(), crate::PipelineError>,
) -> Result<ReconstructionSession> {
    configure(&mut orchestrator).context("configuration failed")?;
    orchestrator.run().context("failed to start reconstruction")?;
    let status = orchestrator.wait_for_terminal();
    let session = orchestrator
        .session()
        .context("orchestrator lost its session")?;
    if status == RunStatus::Failed {
        let message = orchestrator
            .failure()
            .map(|f| format!("iteration {}: {}", f.iteration, f.message))
            .unwrap_or_default();
        bail!("reconstruction failed at {message}");
    }
    Ok(session)
}
