use super::states::RunPhase;
use serde::{Deserialize, Serialize};

/// Events that can move a run (or a flow step) between phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    /// The engine reported this phase during reconciliation
    Observed(RunPhase),
    /// The engine reported this phase after a cancellation was requested
    ObservedAfterCancel(RunPhase),
    /// The cancellation timeout elapsed without an engine-side terminal report
    CancelTimedOut,
    /// The job could not be handed to the engine
    SubmissionFailed(String),
}

impl RunEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Observed(_) => "observed",
            Self::ObservedAfterCancel(_) => "observed_after_cancel",
            Self::CancelTimedOut => "cancel_timed_out",
            Self::SubmissionFailed(_) => "submission_failed",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::SubmissionFailed(msg) => Some(msg),
            _ => None,
        }
    }
}
