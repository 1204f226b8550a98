//! Reconstruct a simulated scan with ePIE, streaming diagnostics and
//! checkpointing into a temporary directory.
//!
//! Run with: `cargo run -p ptychography-pipeline --example synthetic_epie`

use std::sync::Arc;

use anyhow::{Context, Result};
use ptychography_core::synthetic::SyntheticScan;
use ptychography_engines::{EngineRegistry, IterationMetrics};
use ptychography_pipeline::{
    FileSessionStore, IterationBudget, Orchestrator, ReconstructionConfig, load_session,
};

fn main() -> Result<()> {
    let scan = SyntheticScan {
        position_jitter_px: 0.5,
        ..SyntheticScan::default()
    };
    let data = scan.simulate().context("simulating scan")?;
    println!(
        "simulated {} frames of {}",
        data.dataset.len(),
        data.dataset.frame_shape()
    );

    let checkpoints = tempfile::tempdir()?;
    let mut orchestrator = Orchestrator::new(EngineRegistry::with_builtins())
        .with_session_store(Arc::new(FileSessionStore::new(checkpoints.path())));
    orchestrator.configure(
        Arc::new(data.dataset),
        ReconstructionConfig {
            iteration_budget: IterationBudget::Bounded(30),
            checkpoint_interval: Some(10),
            position_correction_enabled: true,
            ..ReconstructionConfig::for_backend("epie")
        },
    )?;
    orchestrator.run()?;

    let diagnostics = orchestrator.diagnostics().context("not configured")?;
    for record in diagnostics.stream() {
        println!(
            "iter {:>3}  fourier error {:.4e}  shift {:.3} px  ({:.2} s)",
            record.iteration,
            record.metrics.get(IterationMetrics::FOURIER_ERROR).unwrap_or(f64::NAN),
            record.metrics.get(IterationMetrics::POSITION_SHIFT).unwrap_or(0.0),
            record.elapsed_s
        );
    }
    let status = orchestrator.wait_for_terminal();
    println!("finished: {status} ({:?})", orchestrator.outcome());

    for checkpoint in orchestrator.checkpoints() {
        let session = load_session(&checkpoint.location)?;
        println!(
            "checkpoint {} -> {} ({} records)",
            checkpoint.iteration,
            checkpoint.location.display(),
            session.history.len()
        );
    }
    Ok(())
}
