//! # Log Record Model
//!
//! Persisted cache of one run step's accumulated log text, keyed by
//! `(run_id, step_id)` and remembering the pod it was read from.

use crate::state_machine::RunPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub run_id: Uuid,
    pub step_id: String,
    pub pod_id: String,
    pub content: String,
    /// Last phase the engine reported for this step
    pub phase: RunPhase,
    pub updated_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(
        run_id: Uuid,
        step_id: impl Into<String>,
        pod_id: impl Into<String>,
        content: impl Into<String>,
        phase: RunPhase,
    ) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            pod_id: pod_id.into(),
            content: content.into(),
            phase,
            updated_at: Utc::now(),
        }
    }

    /// Merge a newer observation into the stored record without shrinking it.
    ///
    /// Log text only grows: a shorter incoming body (for example from a pod
    /// whose logs were rotated away) keeps the stored text. The phase always
    /// follows the newer observation unless the stored one is already terminal.
    pub fn merged_with(&self, incoming: &LogRecord) -> LogRecord {
        let content = if incoming.content.len() >= self.content.len() {
            incoming.content.clone()
        } else {
            self.content.clone()
        };
        let phase = if self.phase.is_terminal() {
            self.phase
        } else {
            incoming.phase
        };
        let pod_id = if incoming.pod_id.is_empty() {
            self.pod_id.clone()
        } else {
            incoming.pod_id.clone()
        };

        LogRecord {
            run_id: self.run_id,
            step_id: self.step_id.clone(),
            pod_id,
            content,
            phase,
            updated_at: incoming.updated_at.max(self.updated_at),
        }
    }
}

/// One step's logs as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step_id: String,
    pub pod_id: String,
    pub content: String,
    pub phase: RunPhase,
}

impl From<LogRecord> for LogEntry {
    fn from(record: LogRecord) -> Self {
        Self {
            step_id: record.step_id,
            pod_id: record.pod_id,
            content: record.content,
            phase: record.phase,
        }
    }
}

/// Sum of log text lengths across records, used for change detection
pub fn total_bytes(records: &[LogRecord]) -> usize {
    records.iter().map(|r| r.content.len()).sum()
}
