//! In-process [`RunStore`] backed by `DashMap`s.
//!
//! Run-number allocation increments the owner's counter under its map entry
//! lock, so concurrent submissions against one task or flow are serialized
//! without any global lock. Deletes take the cascade lock exclusively so a run
//! cannot be created for an owner that is concurrently being removed.
//!
//! ```rust
//! use flowrun_core::models::{DependencySnapshot, TaskDefinition};
//! use flowrun_core::store::{InMemoryRunStore, RunStore};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryRunStore::new();
//! let task = store.create_task(&TaskDefinition::new("sum", "print(1+1)")).await.unwrap();
//! let snapshot = DependencySnapshot {
//!     code: task.code.clone(),
//!     package_dependencies: None,
//!     requirements: None,
//!     system_dependencies: None,
//! };
//!
//! let first = store.create_task_run(task.task_id, &snapshot).await.unwrap();
//! let second = store.create_task_run(task.task_id, &snapshot).await.unwrap();
//! assert_eq!((first.run_number, second.run_number), (1, 2));
//! # });
//! ```

use super::RunStore;
use crate::error::{FlowrunError, Result};
use crate::models::{
    DefinitionState, DependencySnapshot, Flow, FlowDefinition, FlowRun, FlowSnapshot, FlowStepRun,
    LogRecord, PhaseChange, RunHandle, RunKind, Task, TaskDefinition, TaskRun,
};
use crate::state_machine::RunPhase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Debug)]
struct Owned<T> {
    value: T,
    next_run_number: i32,
}

impl<T> Owned<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            next_run_number: 1,
        }
    }

    fn allocate_run_number(&mut self) -> i32 {
        let number = self.next_run_number;
        self.next_run_number += 1;
        number
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    tasks: DashMap<Uuid, Owned<Task>>,
    flows: DashMap<Uuid, Owned<Flow>>,
    task_runs: DashMap<Uuid, TaskRun>,
    flow_runs: DashMap<Uuid, FlowRun>,
    /// Keyed by flow run id
    step_runs: DashMap<Uuid, Vec<FlowStepRun>>,
    log_records: DashMap<(Uuid, String), LogRecord>,
    cascade: RwLock<()>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_run_rows(&self, run_id: Uuid) -> bool {
        let removed = self.task_runs.remove(&run_id).is_some()
            || self.flow_runs.remove(&run_id).is_some();
        self.step_runs.remove(&run_id);
        self.log_records.retain(|(id, _), _| *id != run_id);
        removed
    }
}

/// Write a phase change onto a row's columns; timestamps only fill empty slots.
fn apply_change(
    phase: &mut RunPhase,
    started_at: &mut Option<DateTime<Utc>>,
    finished_at: &mut Option<DateTime<Utc>>,
    change: &PhaseChange,
) {
    *phase = change.phase;
    if started_at.is_none() {
        *started_at = change.started_at;
    }
    if finished_at.is_none() {
        *finished_at = change.finished_at;
    }
}

fn phase_matches(current: RunPhase, expected: RunPhase) -> bool {
    current == expected && !current.is_terminal()
}

fn task_run_handle(run: &TaskRun) -> RunHandle {
    RunHandle {
        run_id: run.task_run_id,
        kind: RunKind::Task,
        owner_id: run.task_id,
        run_number: run.run_number,
        external_job_id: run.external_job_id.clone(),
        phase: run.phase,
        cancel_requested_at: run.cancel_requested_at,
        started_at: run.started_at,
        finished_at: run.finished_at,
        created_at: run.created_at,
    }
}

fn flow_run_handle(run: &FlowRun) -> RunHandle {
    RunHandle {
        run_id: run.flow_run_id,
        kind: RunKind::Flow,
        owner_id: run.flow_id,
        run_number: run.run_number,
        external_job_id: run.external_job_id.clone(),
        phase: run.phase,
        cancel_requested_at: run.cancel_requested_at,
        started_at: run.started_at,
        finished_at: run.finished_at,
        created_at: run.created_at,
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_task(&self, definition: &TaskDefinition) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            name: definition.name.clone(),
            code: definition.code.clone(),
            package_dependencies: definition.package_dependencies.clone(),
            requirements: definition.requirements.clone(),
            system_dependencies: definition.system_dependencies.clone(),
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(task.task_id, Owned::new(task.clone()));
        Ok(task)
    }

    async fn update_task(&self, task_id: Uuid, definition: &TaskDefinition) -> Result<Task> {
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| FlowrunError::not_found("task", task_id))?;
        let task = &mut entry.value;
        task.name = definition.name.clone();
        task.code = definition.code.clone();
        task.package_dependencies = definition.package_dependencies.clone();
        task.requirements = definition.requirements.clone();
        task.system_dependencies = definition.system_dependencies.clone();
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.get(&task_id).map(|e| e.value.clone()))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|e| e.value.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<bool> {
        let _guard = self.cascade.write();
        if self.tasks.remove(&task_id).is_none() {
            return Ok(false);
        }
        let run_ids: Vec<Uuid> = self
            .task_runs
            .iter()
            .filter(|r| r.task_id == task_id)
            .map(|r| r.task_run_id)
            .collect();
        for run_id in run_ids {
            self.remove_run_rows(run_id);
        }
        Ok(true)
    }

    async fn create_flow(&self, definition: &FlowDefinition) -> Result<Flow> {
        let now = Utc::now();
        let flow = Flow {
            flow_id: Uuid::new_v4(),
            name: definition.name.clone(),
            steps: definition.steps.clone(),
            edges: definition.edges.clone(),
            definition_state: DefinitionState::Draft,
            created_at: now,
            updated_at: now,
        };
        self.flows.insert(flow.flow_id, Owned::new(flow.clone()));
        Ok(flow)
    }

    async fn update_flow(&self, flow_id: Uuid, definition: &FlowDefinition) -> Result<Flow> {
        let mut entry = self
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| FlowrunError::not_found("flow", flow_id))?;
        let flow = &mut entry.value;
        flow.name = definition.name.clone();
        flow.steps = definition.steps.clone();
        flow.edges = definition.edges.clone();
        flow.definition_state = DefinitionState::Saved;
        flow.updated_at = Utc::now();
        Ok(flow.clone())
    }

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<Flow>> {
        Ok(self.flows.get(&flow_id).map(|e| e.value.clone()))
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        let mut flows: Vec<Flow> = self.flows.iter().map(|e| e.value.clone()).collect();
        flows.sort_by_key(|f| f.created_at);
        Ok(flows)
    }

    async fn delete_flow(&self, flow_id: Uuid) -> Result<bool> {
        let _guard = self.cascade.write();
        if self.flows.remove(&flow_id).is_none() {
            return Ok(false);
        }
        let run_ids: Vec<Uuid> = self
            .flow_runs
            .iter()
            .filter(|r| r.flow_id == flow_id)
            .map(|r| r.flow_run_id)
            .collect();
        for run_id in run_ids {
            self.remove_run_rows(run_id);
        }
        Ok(true)
    }

    async fn create_task_run(&self, task_id: Uuid, snapshot: &DependencySnapshot) -> Result<TaskRun> {
        let _guard = self.cascade.read();
        let run_number = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| FlowrunError::not_found("task", task_id))?
            .allocate_run_number();

        let run = TaskRun {
            task_run_id: Uuid::new_v4(),
            task_id,
            run_number,
            external_job_id: None,
            phase: RunPhase::Pending,
            snapshot: snapshot.clone(),
            error_message: None,
            cancel_requested_at: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        };
        self.task_runs.insert(run.task_run_id, run.clone());
        Ok(run)
    }

    async fn create_flow_run(
        &self,
        flow_id: Uuid,
        snapshot: &FlowSnapshot,
    ) -> Result<(FlowRun, Vec<FlowStepRun>)> {
        let _guard = self.cascade.read();
        let run_number = self
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| FlowrunError::not_found("flow", flow_id))?
            .allocate_run_number();

        let run = FlowRun {
            flow_run_id: Uuid::new_v4(),
            flow_id,
            run_number,
            external_job_id: None,
            phase: RunPhase::Pending,
            snapshot: snapshot.clone(),
            error_message: None,
            cancel_requested_at: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        };
        let step_runs: Vec<FlowStepRun> = snapshot
            .steps
            .iter()
            .map(|step| FlowStepRun {
                flow_step_run_id: Uuid::new_v4(),
                flow_run_id: run.flow_run_id,
                step_id: step.step_id.clone(),
                external_node_id: None,
                phase: RunPhase::Pending,
                started_at: None,
                finished_at: None,
            })
            .collect();

        self.step_runs.insert(run.flow_run_id, step_runs.clone());
        self.flow_runs.insert(run.flow_run_id, run.clone());
        Ok((run, step_runs))
    }

    async fn get_task_run(&self, task_run_id: Uuid) -> Result<Option<TaskRun>> {
        Ok(self.task_runs.get(&task_run_id).map(|r| r.clone()))
    }

    async fn list_task_runs(&self, task_id: Uuid) -> Result<Vec<TaskRun>> {
        let mut runs: Vec<TaskRun> = self
            .task_runs
            .iter()
            .filter(|r| r.task_id == task_id)
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| b.run_number.cmp(&a.run_number));
        Ok(runs)
    }

    async fn get_flow_run(&self, flow_run_id: Uuid) -> Result<Option<FlowRun>> {
        Ok(self.flow_runs.get(&flow_run_id).map(|r| r.clone()))
    }

    async fn list_flow_runs(&self, flow_id: Uuid) -> Result<Vec<FlowRun>> {
        let mut runs: Vec<FlowRun> = self
            .flow_runs
            .iter()
            .filter(|r| r.flow_id == flow_id)
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| b.run_number.cmp(&a.run_number));
        Ok(runs)
    }

    async fn list_flow_step_runs(&self, flow_run_id: Uuid) -> Result<Vec<FlowStepRun>> {
        Ok(self
            .step_runs
            .get(&flow_run_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunHandle>> {
        if let Some(run) = self.task_runs.get(&run_id) {
            return Ok(Some(task_run_handle(&run)));
        }
        Ok(self.flow_runs.get(&run_id).map(|run| flow_run_handle(&run)))
    }

    async fn list_active_runs(&self) -> Result<Vec<RunHandle>> {
        let mut runs: Vec<RunHandle> = self
            .task_runs
            .iter()
            .filter(|r| r.phase.is_active())
            .map(|r| task_run_handle(&r))
            .chain(
                self.flow_runs
                    .iter()
                    .filter(|r| r.phase.is_active())
                    .map(|r| flow_run_handle(&r)),
            )
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn set_external_job_id(&self, run_id: Uuid, external_job_id: &str) -> Result<()> {
        if let Some(mut run) = self.task_runs.get_mut(&run_id) {
            run.external_job_id = Some(external_job_id.to_string());
            return Ok(());
        }
        if let Some(mut run) = self.flow_runs.get_mut(&run_id) {
            run.external_job_id = Some(external_job_id.to_string());
            return Ok(());
        }
        Err(FlowrunError::not_found("run", run_id))
    }

    async fn update_run_phase(
        &self,
        run_id: Uuid,
        expected: RunPhase,
        change: &PhaseChange,
    ) -> Result<bool> {
        if let Some(mut run) = self.task_runs.get_mut(&run_id) {
            if !phase_matches(run.phase, expected) {
                return Ok(false);
            }
            let run = &mut *run;
            apply_change(&mut run.phase, &mut run.started_at, &mut run.finished_at, change);
            if change.error_message.is_some() {
                run.error_message = change.error_message.clone();
            }
            return Ok(true);
        }
        if let Some(mut run) = self.flow_runs.get_mut(&run_id) {
            if !phase_matches(run.phase, expected) {
                return Ok(false);
            }
            let run = &mut *run;
            apply_change(&mut run.phase, &mut run.started_at, &mut run.finished_at, change);
            if change.error_message.is_some() {
                run.error_message = change.error_message.clone();
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn request_cancel(&self, run_id: Uuid, requested_at: DateTime<Utc>) -> Result<bool> {
        if let Some(mut run) = self.task_runs.get_mut(&run_id) {
            if run.phase.is_terminal() {
                return Ok(false);
            }
            run.cancel_requested_at.get_or_insert(requested_at);
            return Ok(true);
        }
        if let Some(mut run) = self.flow_runs.get_mut(&run_id) {
            if run.phase.is_terminal() {
                return Ok(false);
            }
            run.cancel_requested_at.get_or_insert(requested_at);
            return Ok(true);
        }
        Ok(false)
    }

    async fn update_step_run(
        &self,
        flow_run_id: Uuid,
        step_id: &str,
        expected: RunPhase,
        change: &PhaseChange,
        external_node_id: Option<&str>,
    ) -> Result<bool> {
        let Some(mut steps) = self.step_runs.get_mut(&flow_run_id) else {
            return Ok(false);
        };
        let Some(step) = steps.iter_mut().find(|s| s.step_id == step_id) else {
            return Ok(false);
        };
        if !phase_matches(step.phase, expected) {
            return Ok(false);
        }
        apply_change(&mut step.phase, &mut step.started_at, &mut step.finished_at, change);
        if step.external_node_id.is_none() {
            step.external_node_id = external_node_id.map(str::to_string);
        }
        Ok(true)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool> {
        let _guard = self.cascade.write();
        Ok(self.remove_run_rows(run_id))
    }

    async fn get_log_records(&self, run_id: Uuid) -> Result<Vec<LogRecord>> {
        let mut records: Vec<LogRecord> = self
            .log_records
            .iter()
            .filter(|r| r.key().0 == run_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(records)
    }

    async fn upsert_log_record(&self, record: &LogRecord) -> Result<LogRecord> {
        // held across the existence check so a concurrent delete cannot orphan the record
        let _guard = self.cascade.read();
        if !self.task_runs.contains_key(&record.run_id)
            && !self.flow_runs.contains_key(&record.run_id)
        {
            return Err(FlowrunError::not_found("run", record.run_id));
        }
        let stored = self
            .log_records
            .entry((record.run_id, record.step_id.clone()))
            .and_modify(|existing| *existing = existing.merged_with(record))
            .or_insert_with(|| record.clone());
        Ok(stored.value().clone())
    }
}
