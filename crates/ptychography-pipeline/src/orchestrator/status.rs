//! Orchestrator status, commands and terminal outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a reconstruction run.
///
/// `Idle → Configuring → Running ⇄ Paused → {Completed, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing configured yet.
    Idle,
    /// Configured and ready to run.
    Configuring,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// A worker exists for this status.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control commands accepted by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Configure,
    Run,
    Pause,
    Resume,
    Cancel,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configure => "configure",
            Self::Run => "run",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    BudgetReached,
    EngineExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine reported an error (divergence, resource exhaustion, ...).
    Backend,
    /// The engine produced an update the state rejected.
    InconsistentUpdate,
    /// The engine panicked.
    Panic,
}

/// Why a run failed; the last consistent state is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    /// Iteration that failed; it was not applied.
    pub iteration: usize,
    pub message: String,
}

/// Cause of a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { reason: CompletionReason },
    Cancelled,
    Failed { failure: RunFailure },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Cancelled => RunStatus::Cancelled,
            Self::Failed { .. } => RunStatus::Failed,
        }
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match self {
            Self::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed {
                reason: CompletionReason::BudgetReached,
            } => write!(f, "completed: iteration budget reached"),
            Self::Completed {
                reason: CompletionReason::EngineExhausted,
            } => write!(f, "completed: engine exhausted"),
            Self::Cancelled => write!(f, "cancelled on request"),
            Self::Failed { failure } => {
                write!(f, "failed at iteration {}: {}", failure.iteration, failure.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = RunOutcome::Failed {
            failure: RunFailure {
                kind: FailureKind::Backend,
                iteration: 3,
                message: "diverged".into(),
            },
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""status":"failed""#));
        let back: RunOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status(), RunStatus::Failed);
        assert_eq!(back.failure().map(|f| f.iteration), Some(3));
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Paused.is_active());
        assert_eq!(RunStatus::Configuring.to_string(), "configuring");
    }
}
