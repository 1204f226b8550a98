//! Control block shared by the orchestrator and its worker.
//!
//! Commands set flags under the mutex; the worker reads them only between
//! iterations. Every status change is broadcast on the condvar so observers
//! can block on it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::status::{RunOutcome, RunStatus};

#[derive(Debug)]
pub(crate) struct ControlState {
    pub status: RunStatus,
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub outcome: Option<RunOutcome>,
}

/// What the worker should do at an iteration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Boundary {
    Continue,
    Cancel,
}

#[derive(Debug)]
pub(crate) struct Control {
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl Control {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                status: RunStatus::Idle,
                pause_requested: false,
                cancel_requested: false,
                outcome: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.lock().outcome.clone()
    }

    /// Start a fresh lifecycle at `status`, dropping flags and outcome.
    pub fn reset(&self, status: RunStatus) {
        let mut state = self.lock();
        state.status = status;
        state.pause_requested = false;
        state.cancel_requested = false;
        state.outcome = None;
        drop(state);
        self.notify();
    }

    /// Record the terminal outcome; its status becomes visible here.
    pub fn finish(&self, outcome: RunOutcome) {
        let mut state = self.lock();
        state.status = outcome.status();
        state.pause_requested = false;
        state.outcome = Some(outcome);
        drop(state);
        self.notify();
    }

    /// Called by the worker between iterations. Parks while a pause is
    /// pending and returns once the run may continue or must stop.
    pub fn boundary(&self) -> Boundary {
        let mut state = self.lock();
        loop {
            if state.cancel_requested {
                return Boundary::Cancel;
            }
            if !state.pause_requested {
                if state.status == RunStatus::Paused {
                    state.status = RunStatus::Running;
                    self.notify();
                }
                return Boundary::Continue;
            }
            if state.status != RunStatus::Paused {
                state.status = RunStatus::Paused;
                self.notify();
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until `predicate` holds for the status, or `timeout` elapses.
    /// Returns the status that satisfied the predicate.
    pub fn wait_until(
        &self,
        predicate: impl Fn(RunStatus) -> bool,
        timeout: Option<Duration>,
    ) -> Option<RunStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if predicate(state.status) {
                return Some(state.status);
            }
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pause_parks_the_worker_until_resumed() {
        let control = Arc::new(Control::new());
        control.reset(RunStatus::Running);
        control.lock().pause_requested = true;

        let worker = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.boundary())
        };
        assert_eq!(
            control.wait_until(|s| s == RunStatus::Paused, Some(Duration::from_secs(5))),
            Some(RunStatus::Paused)
        );

        control.lock().pause_requested = false;
        control.notify();
        assert_eq!(worker.join().unwrap(), Boundary::Continue);
        assert_eq!(control.status(), RunStatus::Running);
    }

    #[test]
    fn cancel_wins_over_pause() {
        let control = Control::new();
        control.reset(RunStatus::Running);
        {
            let mut state = control.lock();
            state.pause_requested = true;
            state.cancel_requested = true;
        }
        assert_eq!(control.boundary(), Boundary::Cancel);
    }

    #[test]
    fn wait_times_out() {
        let control = Control::new();
        assert_eq!(
            control.wait_until(RunStatus::is_terminal, Some(Duration::from_millis(5))),
            None
        );
    }
}
