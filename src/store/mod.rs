//! # Run Store
//!
//! Durable state for tasks, flows, their runs and the log cache. The store is
//! the only state shared between submission, reconciliation and log sync, so
//! every write that can race is expressed as an atomic operation here:
//!
//! - run numbers are allocated by an owner-scoped atomic increment together
//!   with the run insert
//! - phase updates are compare-and-set on the phase the caller observed, and
//!   rows already in a terminal phase are never updated
//! - log record upserts never shrink stored content
//!
//! [`InMemoryRunStore`] backs tests and the CLI's in-memory mode;
//! [`PgRunStore`] is the Postgres implementation.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRunStore;
pub use postgres::PgRunStore;

use crate::error::Result;
use crate::models::{
    DependencySnapshot, Flow, FlowDefinition, FlowRun, FlowSnapshot, FlowStepRun, LogRecord,
    PhaseChange, RunHandle, Task, TaskDefinition, TaskRun,
};
use crate::state_machine::RunPhase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait RunStore: Send + Sync {
    // Tasks

    async fn create_task(&self, definition: &TaskDefinition) -> Result<Task>;

    /// Overwrite a task's current fields. Existing run snapshots are untouched.
    async fn update_task(&self, task_id: Uuid, definition: &TaskDefinition) -> Result<Task>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Remove a task with its runs and their log records. Returns false if it did not exist.
    async fn delete_task(&self, task_id: Uuid) -> Result<bool>;

    // Flows

    /// New flows start in the `draft` definition state.
    async fn create_flow(&self, definition: &FlowDefinition) -> Result<Flow>;

    /// Saving a flow moves it to the `saved` definition state.
    async fn update_flow(&self, flow_id: Uuid, definition: &FlowDefinition) -> Result<Flow>;

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<Flow>>;

    async fn list_flows(&self) -> Result<Vec<Flow>>;

    async fn delete_flow(&self, flow_id: Uuid) -> Result<bool>;

    // Runs

    /// Allocate the task's next run number and insert a `Pending` run with `snapshot`.
    async fn create_task_run(&self, task_id: Uuid, snapshot: &DependencySnapshot) -> Result<TaskRun>;

    /// Allocate the flow's next run number and insert a `Pending` run plus one
    /// `Pending` step run per snapshot step.
    async fn create_flow_run(
        &self,
        flow_id: Uuid,
        snapshot: &FlowSnapshot,
    ) -> Result<(FlowRun, Vec<FlowStepRun>)>;

    async fn get_task_run(&self, task_run_id: Uuid) -> Result<Option<TaskRun>>;

    /// Runs of a task, latest first
    async fn list_task_runs(&self, task_id: Uuid) -> Result<Vec<TaskRun>>;

    async fn get_flow_run(&self, flow_run_id: Uuid) -> Result<Option<FlowRun>>;

    /// Runs of a flow, latest first
    async fn list_flow_runs(&self, flow_id: Uuid) -> Result<Vec<FlowRun>>;

    async fn list_flow_step_runs(&self, flow_run_id: Uuid) -> Result<Vec<FlowStepRun>>;

    /// Kind-agnostic view of a task run or flow run
    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunHandle>>;

    /// Every run not yet in a terminal phase
    async fn list_active_runs(&self) -> Result<Vec<RunHandle>>;

    async fn set_external_job_id(&self, run_id: Uuid, external_job_id: &str) -> Result<()>;

    /// Apply `change` if the run is still in `expected`. Returns whether a row was updated.
    async fn update_run_phase(
        &self,
        run_id: Uuid,
        expected: RunPhase,
        change: &PhaseChange,
    ) -> Result<bool>;

    /// Record a cancellation request on a non-terminal run. The first request's time is kept.
    async fn request_cancel(&self, run_id: Uuid, requested_at: DateTime<Utc>) -> Result<bool>;

    /// Compare-and-set for one step of a flow run; also records the engine node id once known.
    async fn update_step_run(
        &self,
        flow_run_id: Uuid,
        step_id: &str,
        expected: RunPhase,
        change: &PhaseChange,
        external_node_id: Option<&str>,
    ) -> Result<bool>;

    /// Remove one run with its step runs and log records.
    async fn delete_run(&self, run_id: Uuid) -> Result<bool>;

    // Log records

    /// Cached log records of a run, ordered by step id
    async fn get_log_records(&self, run_id: Uuid) -> Result<Vec<LogRecord>>;

    /// Insert or merge a record; stored content never shrinks. Returns the stored record.
    async fn upsert_log_record(&self, record: &LogRecord) -> Result<LogRecord>;
}
