//! Reconstruction state: one writer, many readers.
//!
//! The current estimates live in an immutable [`StateSnapshot`] behind an
//! `Arc`. `apply` validates an engine update against the current snapshot,
//! builds the next snapshot and swaps the pointer, so readers only ever see
//! complete snapshots.

use std::sync::{Arc, PoisonError, RwLock};

use log::trace;
use ptychography_core::{InitialGuess, Object, Probe, ScanPositions};
use ptychography_engines::StateUpdate;
use serde::{Deserialize, Serialize};

use crate::error::InconsistentUpdateError;

/// Probe, object and positions after `iteration` applied updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub probe: Probe,
    pub object: Object,
    pub positions: ScanPositions,
    pub iteration: usize,
}

impl StateSnapshot {
    pub fn initial(guess: &InitialGuess) -> Self {
        Self {
            probe: guess.probe.clone(),
            object: guess.object.clone(),
            positions: guess.positions.clone(),
            iteration: 0,
        }
    }

    /// Check that `update` fits this snapshot's shapes.
    fn check(&self, update: &StateUpdate) -> Result<(), InconsistentUpdateError> {
        if let Some(probe) = &update.probe {
            probe.validate()?;
            if probe.num_modes() != self.probe.num_modes() {
                return Err(InconsistentUpdateError::ProbeModes {
                    expected: self.probe.num_modes(),
                    actual: probe.num_modes(),
                });
            }
            if probe.shape() != self.probe.shape() {
                return Err(InconsistentUpdateError::ProbeShape {
                    expected: self.probe.shape(),
                    actual: probe.shape(),
                });
            }
        }
        if let Some(object) = &update.object {
            object.validate()?;
            if object.num_layers() != self.object.num_layers() {
                return Err(InconsistentUpdateError::ObjectLayers {
                    expected: self.object.num_layers(),
                    actual: object.num_layers(),
                });
            }
            if object.shape() != self.object.shape() {
                return Err(InconsistentUpdateError::ObjectShape {
                    expected: self.object.shape(),
                    actual: object.shape(),
                });
            }
        }
        if let Some(positions) = &update.positions {
            positions.validate()?;
            if positions.len() != self.positions.len() {
                return Err(InconsistentUpdateError::PositionCount {
                    expected: self.positions.len(),
                    actual: positions.len(),
                });
            }
        }
        Ok(())
    }
}

type Shared = Arc<RwLock<Arc<StateSnapshot>>>;

/// Writer handle; owned by whoever drives the iterations.
#[derive(Debug)]
pub struct ReconstructionState {
    current: Shared,
}

impl ReconstructionState {
    pub fn new(snapshot: StateSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        load(&self.current)
    }

    pub fn iteration(&self) -> usize {
        self.snapshot().iteration
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            current: Arc::clone(&self.current),
        }
    }

    /// Apply one iteration's update and advance the iteration index.
    ///
    /// On error nothing changes.
    pub fn apply(&mut self, update: StateUpdate) -> Result<Arc<StateSnapshot>, InconsistentUpdateError> {
        let current = self.snapshot();
        current.check(&update)?;
        let StateUpdate {
            probe,
            object,
            positions,
        } = update;
        let next = Arc::new(StateSnapshot {
            probe: probe.unwrap_or_else(|| current.probe.clone()),
            object: object.unwrap_or_else(|| current.object.clone()),
            positions: positions.unwrap_or_else(|| current.positions.clone()),
            iteration: current.iteration + 1,
        });
        trace!("state advanced to iteration {}", next.iteration);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        Ok(next)
    }
}

/// Cloneable read-only view of a [`ReconstructionState`].
#[derive(Debug, Clone)]
pub struct StateReader {
    current: Shared,
}

impl StateReader {
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        load(&self.current)
    }

    pub fn iteration(&self) -> usize {
        self.snapshot().iteration
    }
}

fn load(shared: &Shared) -> Arc<StateSnapshot> {
    Arc::clone(&shared.read().unwrap_or_else(PoisonError::into_inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptychography_core::test_utils::small_dataset;
    use ptychography_core::{
        ComplexGrid, ObjectInitOptions, ProbeInitOptions, ScanPoint, SliceLayout,
    };

    fn state() -> ReconstructionState {
        let dataset = small_dataset();
        let guess = InitialGuess::build(
            &dataset,
            &ProbeInitOptions::default(),
            &ObjectInitOptions::default(),
            SliceLayout::default(),
        )
        .unwrap();
        ReconstructionState::new(StateSnapshot::initial(&guess))
    }

    #[test]
    fn apply_replaces_given_fields_and_counts_iterations() {
        let mut state = state();
        let reader = state.reader();
        let before = reader.snapshot();

        let mut probe = before.probe.clone();
        probe.modes[0] *= ptychography_core::Complex64::new(0.5, 0.0);
        let after = state
            .apply(StateUpdate {
                probe: Some(probe.clone()),
                ..StateUpdate::default()
            })
            .unwrap();

        assert_eq!(after.iteration, 1);
        assert_eq!(reader.snapshot().probe, probe);
        assert_eq!(reader.snapshot().object, before.object);
        // The old snapshot is untouched.
        assert_eq!(before.iteration, 0);

        state.apply(StateUpdate::default()).unwrap();
        assert_eq!(reader.iteration(), 2);
    }

    #[test]
    fn inconsistent_updates_leave_state_unchanged() {
        let mut state = state();
        let before = state.snapshot();

        let wrong_object = Object::single(ComplexGrid::zeros(3, 3));
        let err = state
            .apply(StateUpdate {
                object: Some(wrong_object),
                probe: Some(before.probe.clone()),
                ..StateUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, InconsistentUpdateError::ObjectShape { .. }));

        let short = ScanPositions::new(vec![ScanPoint::new(0.0, 0.0)]);
        assert!(matches!(
            state.apply(StateUpdate {
                positions: Some(short),
                ..StateUpdate::default()
            }),
            Err(InconsistentUpdateError::PositionCount { .. })
        ));

        let mut nan_probe = before.probe.clone();
        nan_probe.modes[0][(0, 0)].re = f64::NAN;
        assert!(matches!(
            state.apply(StateUpdate {
                probe: Some(nan_probe),
                ..StateUpdate::default()
            }),
            Err(InconsistentUpdateError::Model(_))
        ));

        assert_eq!(state.snapshot(), before);
    }
}
