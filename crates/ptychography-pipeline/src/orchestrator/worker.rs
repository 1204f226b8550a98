//! The iteration loop run on the worker thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{debug, error, info, warn};
use ptychography_engines::{EngineContext, EngineError, StepOutput};

use super::checkpoint::CheckpointWriter;
use super::control::{Boundary, Control};
use super::status::{CompletionReason, FailureKind, RunFailure, RunOutcome, RunStatus};
use crate::config::IterationBudget;
use crate::diagnostics::{DiagnosticsSink, IterationRecord};
use crate::session::{LogEntry, ReconstructionSession, SessionHeader};
use crate::state::ReconstructionState;

pub(crate) struct Worker {
    pub context: Box<dyn EngineContext>,
    pub state: ReconstructionState,
    pub budget: IterationBudget,
    pub checkpoint_interval: Option<usize>,
    pub checkpoints: Option<CheckpointWriter>,
    pub diagnostics: Arc<DiagnosticsSink>,
    /// Held while a state update and its record are published together.
    pub publish: Arc<Mutex<()>>,
    pub control: Arc<Control>,
    pub header: SessionHeader,
    pub log: Arc<Mutex<Vec<LogEntry>>>,
}

impl Worker {
    pub fn run(mut self) {
        let started = self.state.iteration();
        let outcome = self.iterate();
        let applied = self.state.iteration() - started;

        // Pending checkpoints land before the run is reported terminal.
        if let Some(writer) = self.checkpoints.take() {
            writer.finish();
        }
        self.diagnostics.close();

        match &outcome {
            RunOutcome::Failed { failure } => {
                error!("reconstruction {outcome} after {applied} iterations");
                self.push_log(LogEntry::failure("run", failure.message.clone()));
            }
            _ => {
                info!("reconstruction {outcome} after {applied} iterations");
                self.push_log(LogEntry::success_with_notes("run", outcome.to_string()));
            }
        }
        self.control.finish(outcome);
    }

    fn iterate(&mut self) -> RunOutcome {
        let mut elapsed_s = self.diagnostics.latest().map_or(0.0, |r| r.elapsed_s);
        loop {
            if self.control.boundary() == Boundary::Cancel {
                return RunOutcome::Cancelled;
            }
            let iteration = self.state.iteration() + 1;
            if !self.budget.allows(iteration) {
                return RunOutcome::Completed {
                    reason: CompletionReason::BudgetReached,
                };
            }

            let started = Instant::now();
            let output = match self.step(iteration) {
                Ok(output) => output,
                Err(failure) => return RunOutcome::Failed { failure },
            };
            let StepOutput {
                update,
                metrics,
                exhausted,
            } = output;
            let step_time_s = started.elapsed().as_secs_f64();
            elapsed_s += step_time_s;
            debug!("iteration {iteration} took {step_time_s:.3} s");
            {
                let _published = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = self.state.apply(update) {
                    return RunOutcome::Failed {
                        failure: RunFailure {
                            kind: FailureKind::InconsistentUpdate,
                            iteration,
                            message: e.to_string(),
                        },
                    };
                }
                if let Err(e) = self.diagnostics.record(IterationRecord {
                    iteration,
                    step_time_s,
                    elapsed_s,
                    metrics,
                }) {
                    warn!("dropping diagnostics for iteration {iteration}: {e}");
                }
            }

            if self
                .checkpoint_interval
                .is_some_and(|every| iteration % every == 0)
            {
                self.checkpoint();
            }
            if exhausted {
                return RunOutcome::Completed {
                    reason: CompletionReason::EngineExhausted,
                };
            }
        }
    }

    /// One engine step; errors and panics become a failure of `iteration`.
    fn step(&mut self, iteration: usize) -> Result<StepOutput, RunFailure> {
        let context = &mut self.context;
        match panic::catch_unwind(AssertUnwindSafe(|| context.step(iteration))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(backend_failure(iteration, &e)),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "engine panicked".to_string());
                Err(RunFailure {
                    kind: FailureKind::Panic,
                    iteration,
                    message,
                })
            }
        }
    }

    fn checkpoint(&self) {
        let Some(writer) = &self.checkpoints else {
            return;
        };
        let session = ReconstructionSession::assemble(
            &self.header,
            (*self.state.snapshot()).clone(),
            self.diagnostics.records(),
            RunStatus::Running,
            None,
            self.log.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        );
        writer.submit(session);
    }

    fn push_log(&self, entry: LogEntry) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

fn backend_failure(iteration: usize, e: &EngineError) -> RunFailure {
    RunFailure {
        kind: FailureKind::Backend,
        iteration,
        message: e.to_string(),
    }
}
