//! Reconstruction sessions: the unit of persistence.
//!
//! A session bundles everything needed to inspect or resume a
//! reconstruction: the dataset it was computed from (by reference), the
//! configuration, the object geometry, the current state, the iteration
//! history, and the run status with its terminal outcome.
//!
//! Sessions are JSON documents with a schema version. Loading is forward
//! compatible (unknown fields are ignored) but fails closed on newer schema
//! versions and on internally inconsistent contents.

mod types;

pub use types::{LogEntry, SessionMetadata, current_timestamp};

use ptychography_core::{DatasetSummary, ObjectGeometry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ReconstructionConfig;
use crate::diagnostics::IterationRecord;
use crate::error::CorruptSessionError;
use crate::orchestrator::{RunOutcome, RunStatus};
use crate::state::StateSnapshot;

/// Document kind written into [`SessionMetadata::kind`].
pub const SESSION_KIND: &str = "ptychography_reconstruction";

/// Newest schema version this crate reads and the one it writes.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Parts of a session fixed at configure time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHeader {
    pub metadata: SessionMetadata,
    pub dataset: DatasetSummary,
    pub config: ReconstructionConfig,
    pub geometry: ObjectGeometry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionSession {
    pub metadata: SessionMetadata,
    pub dataset: DatasetSummary,
    pub config: ReconstructionConfig,
    pub geometry: ObjectGeometry,
    pub state: StateSnapshot,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
    pub status: RunStatus,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl ReconstructionSession {
    pub fn assemble(
        header: &SessionHeader,
        state: StateSnapshot,
        history: Vec<IterationRecord>,
        status: RunStatus,
        outcome: Option<RunOutcome>,
        log: Vec<LogEntry>,
    ) -> Self {
        let mut metadata = header.metadata.clone();
        metadata.touch();
        Self {
            metadata,
            dataset: header.dataset.clone(),
            config: header.config.clone(),
            geometry: header.geometry,
            state,
            history,
            status,
            outcome,
            log,
        }
    }

    pub fn header(&self) -> SessionHeader {
        SessionHeader {
            metadata: self.metadata.clone(),
            dataset: self.dataset.clone(),
            config: self.config.clone(),
            geometry: self.geometry,
        }
    }

    /// Iterations applied to the stored state.
    pub fn iteration(&self) -> usize {
        self.state.iteration
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse and check a session document.
    ///
    /// The schema version is checked before the body is decoded, so a newer
    /// document reports [`CorruptSessionError::NewerSchema`] even when its
    /// layout changed.
    pub fn from_json(json: &str) -> Result<Self, CorruptSessionError> {
        let value: Value = serde_json::from_str(json).map_err(CorruptSessionError::Malformed)?;
        let version = value
            .pointer("/metadata/schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| CorruptSessionError::Inconsistent("missing schema version".into()))?;
        let found = u32::try_from(version).unwrap_or(u32::MAX);
        if found > SESSION_SCHEMA_VERSION {
            return Err(CorruptSessionError::NewerSchema {
                found,
                supported: SESSION_SCHEMA_VERSION,
            });
        }
        let session: Self =
            serde_json::from_value(value).map_err(CorruptSessionError::Malformed)?;
        session.validate()?;
        Ok(session)
    }

    /// Cross-check the stored state against the dataset summary and geometry.
    pub fn validate(&self) -> Result<(), CorruptSessionError> {
        let inconsistent = |reason: String| Err(CorruptSessionError::Inconsistent(reason));
        if self.metadata.kind != SESSION_KIND {
            return inconsistent(format!("unexpected document kind '{}'", self.metadata.kind));
        }
        let state = &self.state;
        if let Err(e) = state.probe.validate() {
            return inconsistent(format!("probe: {e}"));
        }
        if let Err(e) = state.object.validate() {
            return inconsistent(format!("object: {e}"));
        }
        if let Err(e) = state.positions.validate() {
            return inconsistent(format!("positions: {e}"));
        }
        let frame_shape = self.dataset.metadata.frame_shape;
        if state.probe.shape() != frame_shape {
            return inconsistent(format!(
                "probe shape {} does not match frame shape {frame_shape}",
                state.probe.shape()
            ));
        }
        if state.object.shape() != self.geometry.shape {
            return inconsistent(format!(
                "object shape {} does not match geometry {}",
                state.object.shape(),
                self.geometry.shape
            ));
        }
        if state.positions.len() != self.dataset.frame_count {
            return inconsistent(format!(
                "{} positions for {} frames",
                state.positions.len(),
                self.dataset.frame_count
            ));
        }
        let mut last = 0;
        for record in &self.history {
            if record.iteration <= last || record.iteration > state.iteration {
                return inconsistent(format!(
                    "history record for iteration {} out of order (state at {})",
                    record.iteration, state.iteration
                ));
            }
            last = record.iteration;
        }
        if self.status.is_terminal() != self.outcome.is_some() {
            return inconsistent(format!(
                "status {} with outcome {:?}",
                self.status, self.outcome
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ptychography_core::test_utils::small_dataset;
    use ptychography_core::{InitialGuess, ObjectInitOptions, ProbeInitOptions, SliceLayout};
    use ptychography_engines::IterationMetrics;

    pub(crate) fn sample_session() -> ReconstructionSession {
        let dataset = small_dataset();
        let guess = InitialGuess::build(
            &dataset,
            &ProbeInitOptions::default(),
            &ObjectInitOptions::default(),
            SliceLayout::default(),
        )
        .unwrap();
        let header = SessionHeader {
            metadata: SessionMetadata::new(SESSION_KIND, SESSION_SCHEMA_VERSION),
            dataset: dataset.summary(),
            config: ReconstructionConfig::default(),
            geometry: guess.geometry,
        };
        let mut state = StateSnapshot::initial(&guess);
        state.iteration = 2;
        let history = (1..=2)
            .map(|i| IterationRecord {
                iteration: i,
                step_time_s: 0.5,
                elapsed_s: 0.5 * i as f64,
                metrics: IterationMetrics::new().with(IterationMetrics::FOURIER_ERROR, 0.1),
            })
            .collect();
        ReconstructionSession::assemble(
            &header,
            state,
            history,
            RunStatus::Paused,
            None,
            vec![LogEntry::success_with_notes("configure", "backend epie")],
        )
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let session = sample_session();
        let json = session.to_json().unwrap();
        let back = ReconstructionSession::from_json(&json).unwrap();
        assert_eq!(back, session);
        assert_eq!(back.iteration(), 2);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let session = sample_session();
        let mut value = serde_json::to_value(&session).unwrap();
        value["annotations"] = serde_json::json!({"beamline": "2-ID-D"});
        let back = ReconstructionSession::from_json(&value.to_string()).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn newer_schema_fails_closed() {
        let mut value = serde_json::to_value(sample_session()).unwrap();
        value["metadata"]["schema_version"] = serde_json::json!(SESSION_SCHEMA_VERSION + 1);
        value["state"] = serde_json::json!("restructured");
        let err = ReconstructionSession::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, CorruptSessionError::NewerSchema { found: 2, supported: 1 }));
    }

    #[test]
    fn shape_mismatch_is_inconsistent() {
        let mut session = sample_session();
        session.dataset.frame_count += 1;
        let json = session.to_json().unwrap();
        assert!(matches!(
            ReconstructionSession::from_json(&json),
            Err(CorruptSessionError::Inconsistent(_))
        ));
    }

    #[test]
    fn truncated_document_is_malformed() {
        let json = sample_session().to_json().unwrap();
        let truncated = &json[..json.len() / 2];
        assert!(matches!(
            ReconstructionSession::from_json(truncated),
            Err(CorruptSessionError::Malformed(_))
        ));
    }
}
