//! Kind-agnostic view of a run, used by reconciliation and log sync which
//! only know a run id.

use crate::state_machine::RunPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Task,
    Flow,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => f.write_str("task"),
            Self::Flow => f.write_str("flow"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub kind: RunKind,
    /// Task id or flow id
    pub owner_id: Uuid,
    pub run_number: i32,
    pub external_job_id: Option<String>,
    pub phase: RunPhase,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A phase transition plus the timestamps it sets.
///
/// Timestamps only fill empty columns; an existing `started_at` is never moved.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseChange {
    pub phase: RunPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl PhaseChange {
    /// Build the change for entering `phase` at `now`, preferring engine-reported times.
    pub fn entering(
        phase: RunPhase,
        now: DateTime<Utc>,
        reported_start: Option<DateTime<Utc>>,
        reported_finish: Option<DateTime<Utc>>,
    ) -> Self {
        let started_at = match phase {
            RunPhase::Running | RunPhase::Succeeded | RunPhase::Failed => {
                Some(reported_start.unwrap_or(now))
            }
            _ => reported_start,
        };
        let finished_at = phase
            .is_terminal()
            .then(|| reported_finish.unwrap_or(now));

        Self {
            phase,
            started_at,
            finished_at,
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
