//! # Flow Model
//!
//! A flow is a DAG of script steps. Each submission creates a [`FlowRun`]
//! carrying a [`FlowSnapshot`] of the steps and edges it executed, plus one
//! [`FlowStepRun`] per step so a failing step stays identifiable.

use crate::state_machine::RunPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Canvas position; presentation only
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the flow; also names the step's shared-volume directory
    pub step_id: String,
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub package_dependencies: Option<String>,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub system_dependencies: Option<String>,
    #[serde(default)]
    pub position: Position,
}

impl Step {
    pub fn new(step_id: impl Into<String>, code: impl Into<String>) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id,
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_package_dependencies(mut self, packages: impl Into<String>) -> Self {
        self.package_dependencies = Some(packages.into());
        self
    }

    pub fn with_system_dependencies(mut self, packages: impl Into<String>) -> Self {
        self.system_dependencies = Some(packages.into());
        self
    }
}

/// `target` depends on `source`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Whether the author has saved the definition at least once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionState {
    #[default]
    Draft,
    Saved,
}

impl DefinitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Saved => "saved",
        }
    }
}

impl std::str::FromStr for DefinitionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "saved" => Ok(Self::Saved),
            _ => Err(format!("Invalid definition state: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub flow_id: Uuid,
    pub name: String,
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
    pub definition_state: DefinitionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            steps: self.steps.clone(),
            edges: self.edges.clone(),
        }
    }
}

/// Editable fields of a flow, used for both create and save
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }
}

/// Steps and edges exactly as submitted for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
}

/// Coarse status shown for a flow, derived from its latest run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Draft,
    Saved,
    Running,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn derive(definition_state: DefinitionState, latest_run_phase: Option<RunPhase>) -> Self {
        match latest_run_phase {
            None | Some(RunPhase::Cancelled) => match definition_state {
                DefinitionState::Draft if latest_run_phase.is_none() => Self::Draft,
                _ => Self::Saved,
            },
            Some(RunPhase::NotStarted | RunPhase::Pending | RunPhase::Running) => Self::Running,
            Some(RunPhase::Succeeded) => Self::Completed,
            Some(RunPhase::Failed) => Self::Failed,
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Draft => "draft",
            Self::Saved => "saved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One execution attempt of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub flow_run_id: Uuid,
    pub flow_id: Uuid,
    pub run_number: i32,
    pub external_job_id: Option<String>,
    pub phase: RunPhase,
    pub snapshot: FlowSnapshot,
    pub error_message: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Status of a single step within a flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStepRun {
    pub flow_step_run_id: Uuid,
    pub flow_run_id: Uuid,
    pub step_id: String,
    /// Engine sub-unit id, known once the engine schedules the step
    pub external_node_id: Option<String>,
    pub phase: RunPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A flow run together with the status of each of its steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunDetail {
    pub run: FlowRun,
    pub steps: Vec<FlowStepRun>,
}

impl FlowRunDetail {
    /// Steps that ended in `Failed`
    pub fn failed_steps(&self) -> impl Iterator<Item = &FlowStepRun> {
        self.steps.iter().filter(|s| s.phase == RunPhase::Failed)
    }
}
