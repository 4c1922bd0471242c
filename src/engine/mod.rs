//! # Execution Engine Boundary
//!
//! The external workflow engine accepts a [`JobSpec`], runs it, and exposes
//! phase and log data. Everything the core knows about the engine goes
//! through the [`ExecutionEngine`] trait; [`ArgoEngineClient`] is the HTTP
//! implementation and `test_helpers::MockEngine` (feature `test-utils`) the
//! in-process one.

pub mod argo;
pub mod job_spec;

pub use argo::ArgoEngineClient;
pub use job_spec::{
    template_name_for, DagTask, JobMetadata, JobSpec, MultiStepDagJob, ScriptTemplate,
    SharedVolume, SingleStepJob,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures talking to the engine. These are transient from the core's point of view.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("engine returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("could not decode engine response: {0}")]
    Decode(String),
    #[error("sub-unit {0} has no logs yet")]
    LogsUnavailable(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Phase vocabulary reported by the engine for jobs and their sub-units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnginePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    /// Not run because a condition was false
    Skipped,
    /// Not run because a dependency did not succeed
    Omitted,
}

impl EnginePhase {
    /// Parse the engine's phase string; unknown or empty values read as `Pending`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Error" => Self::Error,
            "Skipped" => Self::Skipped,
            "Omitted" => Self::Omitted,
            "" | "Pending" => Self::Pending,
            other => {
                tracing::debug!(phase = other, "Unrecognized engine phase; treating as Pending");
                Self::Pending
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    pub fn has_started(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Succeeded | Self::Failed | Self::Error
        )
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Status of one schedulable unit (a pod) within a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubUnitStatus {
    /// Engine node id
    pub id: String,
    /// Template name the unit executes; maps back to a step
    pub name: String,
    pub phase: EnginePhase,
    /// Identifier to request logs with, once the unit has a pod
    pub pod_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl SubUnitStatus {
    pub fn log_source(&self) -> &str {
        self.pod_name.as_deref().unwrap_or(&self.id)
    }
}

/// Point-in-time status of a submitted job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: EnginePhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub sub_units: Vec<SubUnitStatus>,
}

impl EngineStatus {
    /// Sub-units executing the given engine template
    pub fn sub_units_for<'a>(
        &'a self,
        template_name: &'a str,
    ) -> impl Iterator<Item = &'a SubUnitStatus> + 'a {
        self.sub_units.iter().filter(move |u| u.name == template_name)
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Submit a job; returns the engine's identifier for it
    async fn submit(&self, spec: &JobSpec) -> EngineResult<String>;

    /// Current status, or `None` if the engine does not know the job
    async fn get_status(&self, external_job_id: &str) -> EngineResult<Option<EngineStatus>>;

    /// Full log text of one sub-unit
    async fn get_logs(&self, external_job_id: &str, sub_unit_id: &str) -> EngineResult<String>;

    /// Best-effort stop request
    async fn cancel(&self, external_job_id: &str) -> EngineResult<()>;
}
