use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a task run, flow run, or a single step within a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// The engine has no record of the job (not yet visible, or expired)
    NotStarted,
    /// Job exists but nothing has started executing
    #[default]
    Pending,
    /// At least one step has started and none has failed
    Running,
    /// Every step completed without failure
    Succeeded,
    /// Some step failed or errored, or the job could not be submitted
    Failed,
    /// Stopped on request
    Cancelled,
}

impl RunPhase {
    /// Terminal phases are sticky: no further transitions are applied
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the run is still expected to make progress
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Progress ordering used to reject regressions from stale engine data
    pub fn rank(&self) -> u8 {
        match self {
            Self::NotStarted | Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Phases stored as terminal, in their persisted spelling
    pub const TERMINAL: [RunPhase; 3] = [Self::Succeeded, Self::Failed, Self::Cancelled];
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run phase: {s}")),
        }
    }
}
