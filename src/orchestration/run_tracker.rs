//! # Run Lifecycle Tracker
//!
//! Owns every run: creates the run row on submission, hands the compiled job
//! to the engine, and reconciles stored phases against the engine's reports.
//!
//! ## Submission
//!
//! Definitions are validated and compiled *before* a run row exists, so a
//! rejected definition never consumes a run number and never reaches the
//! engine. The row is then created (allocating the next run number and
//! snapshotting what will execute) and the job submitted. A failed submission
//! leaves the run `Failed` and surfaces [`FlowrunError::EngineUnavailable`].
//!
//! ## Reconciliation
//!
//! [`RunLifecycleTracker::reconcile`] is idempotent. Phase changes go through
//! [`RunStateMachine`] and are written as compare-and-set, so duplicate or
//! concurrent reconciliation never regresses a run and never leaves a
//! terminal phase.

use super::events::{PhaseTransition, RunEventPublisher};
use super::phase_resolver::{
    determine_run_phase, failure_message, latest_sub_unit, sub_unit_phase,
};
use crate::compiler::DagCompiler;
use crate::constants::{labels, operations};
use crate::engine::{template_name_for, EngineStatus, ExecutionEngine, JobSpec};
use crate::error::{FlowrunError, Result};
use crate::logging::log_run_operation;
use crate::models::{
    DependencySnapshot, FlowRunDetail, PhaseChange, RunHandle, RunKind, RunOverrides, TaskRun,
};
use crate::state_machine::{RunEvent, RunPhase, RunStateMachine};
use crate::store::RunStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Compare-and-set attempts when recording a failed submission
const SUBMISSION_FAILURE_ATTEMPTS: usize = 8;

/// Result of reconciling one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Transitioned { from: RunPhase, to: RunPhase },
    Unchanged(RunPhase),
    /// The run was already terminal; nothing was asked of the engine
    AlreadyTerminal(RunPhase),
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Stop requested; the run becomes `Cancelled` once reconciliation sees it
    /// stop or the cancel timeout elapses
    Requested,
    AlreadyTerminal(RunPhase),
}

pub struct RunLifecycleTracker {
    store: Arc<dyn RunStore>,
    engine: Arc<dyn ExecutionEngine>,
    compiler: DagCompiler,
    cancel_timeout: Duration,
    events: RunEventPublisher,
}

impl std::fmt::Debug for RunLifecycleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLifecycleTracker")
            .field("compiler", &self.compiler)
            .field("cancel_timeout", &self.cancel_timeout)
            .finish_non_exhaustive()
    }
}

impl RunLifecycleTracker {
    pub fn new(
        store: Arc<dyn RunStore>,
        engine: Arc<dyn ExecutionEngine>,
        compiler: DagCompiler,
        cancel_timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            compiler,
            cancel_timeout,
            events: RunEventPublisher::default(),
        }
    }

    pub fn with_event_publisher(mut self, events: RunEventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &RunEventPublisher {
        &self.events
    }

    pub fn compiler(&self) -> &DagCompiler {
        &self.compiler
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Submit a task with optional overrides for code and dependencies.
    pub async fn submit_task(&self, task_id: Uuid, overrides: &RunOverrides) -> Result<TaskRun> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("task", task_id))?;

        let snapshot = DependencySnapshot::resolve(&task, overrides);
        self.submit_task_snapshot(task_id, snapshot).await
    }

    /// Submit a task again starting from an earlier run's snapshot.
    ///
    /// System dependencies are taken from the override or the task's current
    /// value, never from the earlier run.
    pub async fn rerun_task(&self, task_run_id: Uuid, overrides: &RunOverrides) -> Result<TaskRun> {
        let previous = self
            .store
            .get_task_run(task_run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("task_run", task_run_id))?;
        let task = self
            .store
            .get_task(previous.task_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("task", previous.task_id))?;

        let snapshot = DependencySnapshot::for_rerun(&previous.snapshot, &task, overrides);
        self.submit_task_snapshot(task.task_id, snapshot).await
    }

    async fn submit_task_snapshot(
        &self,
        task_id: Uuid,
        snapshot: DependencySnapshot,
    ) -> Result<TaskRun> {
        let spec = self.compiler.compile_task(&snapshot)?;
        let run = self.store.create_task_run(task_id, &snapshot).await?;

        self.submit_run(
            run.task_run_id,
            RunKind::Task,
            task_id,
            run.run_number,
            spec,
        )
        .await?;

        log_run_operation(
            operations::SUBMIT_TASK,
            run.task_run_id,
            Some(run.run_number),
            RunPhase::Pending.as_str(),
            None,
        );

        self.store
            .get_task_run(run.task_run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("task_run", run.task_run_id))
    }

    /// Compile and submit the flow's current definition.
    pub async fn submit_flow(&self, flow_id: Uuid) -> Result<FlowRunDetail> {
        let flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("flow", flow_id))?;

        let snapshot = flow.snapshot();
        let compiled = self.compiler.compile(&snapshot.steps, &snapshot.edges)?;
        let (run, _) = self.store.create_flow_run(flow_id, &snapshot).await?;

        self.submit_run(
            run.flow_run_id,
            RunKind::Flow,
            flow_id,
            run.run_number,
            compiled.spec,
        )
        .await?;

        log_run_operation(
            operations::SUBMIT_FLOW,
            run.flow_run_id,
            Some(run.run_number),
            RunPhase::Pending.as_str(),
            Some(&format!("{} steps", snapshot.steps.len())),
        );

        self.flow_run_detail(run.flow_run_id).await
    }

    pub async fn flow_run_detail(&self, flow_run_id: Uuid) -> Result<FlowRunDetail> {
        let run = self
            .store
            .get_flow_run(flow_run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("flow_run", flow_run_id))?;
        let steps = self.store.list_flow_step_runs(flow_run_id).await?;
        Ok(FlowRunDetail { run, steps })
    }

    async fn submit_run(
        &self,
        run_id: Uuid,
        kind: RunKind,
        owner_id: Uuid,
        run_number: i32,
        mut spec: JobSpec,
    ) -> Result<()> {
        let metadata = spec.metadata_mut();
        for (key, value) in [
            (labels::OWNER_ID, owner_id.to_string()),
            (labels::RUN_ID, run_id.to_string()),
            (labels::RUN_NUMBER, run_number.to_string()),
            (labels::KIND, kind.to_string()),
        ] {
            metadata.labels.insert(key.to_string(), value);
        }

        match self.engine.submit(&spec).await {
            Ok(external_job_id) => {
                self.store.set_external_job_id(run_id, &external_job_id).await?;
                debug!(%run_id, external_job_id, "Run submitted");
                Ok(())
            }
            Err(engine_error) => {
                let reason = format!("submission failed: {engine_error}");
                self.mark_submission_failed(run_id, kind, run_number, &reason)
                    .await?;
                warn!(%run_id, error = %engine_error, "❌ Engine rejected submission");
                Err(engine_error.into())
            }
        }
    }

    /// Move a run whose submission failed to `Failed` from whatever
    /// non-terminal phase it holds now. A reconciler may have moved it off
    /// `Pending` while the submit call was in flight.
    async fn mark_submission_failed(
        &self,
        run_id: Uuid,
        kind: RunKind,
        run_number: i32,
        reason: &str,
    ) -> Result<()> {
        let event = RunEvent::SubmissionFailed(reason.to_string());
        for _ in 0..SUBMISSION_FAILURE_ATTEMPTS {
            let Some(run) = self.store.get_run(run_id).await? else {
                return Ok(());
            };
            let Some(target) = RunStateMachine::determine_target_state(run.phase, &event) else {
                return Ok(());
            };
            let change = PhaseChange::entering(target, Utc::now(), None, None).with_error(reason);
            if self.store.update_run_phase(run_id, run.phase, &change).await? {
                self.publish(run_id, kind, run_number, run.phase, target, &event);
                return Ok(());
            }
        }
        warn!(%run_id, "Run kept changing phase; submission failure not recorded");
        Ok(())
    }

    /// Bring a run's stored phase in line with the engine's report.
    pub async fn reconcile(&self, run_id: Uuid) -> Result<ReconcileOutcome> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("run", run_id))?;

        if run.phase.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal(run.phase));
        }

        let (status, event) = match &run.external_job_id {
            Some(job_id) => match self.engine.get_status(job_id).await {
                Ok(status) => {
                    let observed = determine_run_phase(status.as_ref());
                    (status, self.event_for(&run, observed))
                }
                Err(e) if self.cancel_expired(&run) => {
                    // an unreachable engine must not hold a timed-out cancel open
                    warn!(%run_id, error = %e, "Engine unreachable; applying expired cancel");
                    (None, RunEvent::CancelTimedOut)
                }
                Err(e) => return Err(e.into()),
            },
            None => (None, self.event_for(&run, determine_run_phase(None))),
        };
        let observed = determine_run_phase(status.as_ref());

        if run.kind == RunKind::Flow {
            if let Some(status) = &status {
                self.reconcile_steps(run.run_id, status).await?;
            }
        }

        if run.cancel_requested_at.is_some() && observed.is_active() {
            if let Some(job_id) = &run.external_job_id {
                // stop is idempotent; repeat it until the engine acts on it
                if let Err(e) = self.engine.cancel(job_id).await {
                    debug!(%run_id, error = %e, "Repeated stop request failed");
                }
            }
        }

        let Some(target) = RunStateMachine::determine_target_state(run.phase, &event) else {
            return Ok(ReconcileOutcome::Unchanged(run.phase));
        };

        let mut change = PhaseChange::entering(
            target,
            Utc::now(),
            status.as_ref().and_then(|s| s.started_at),
            status.as_ref().and_then(|s| s.finished_at),
        );
        if target == RunPhase::Failed {
            if let Some(message) = status.as_ref().and_then(failure_message) {
                change = change.with_error(message);
            }
        }

        if !self.store.update_run_phase(run_id, run.phase, &change).await? {
            // another reconciler got there first
            let current = self
                .store
                .get_run(run_id)
                .await?
                .map(|r| r.phase)
                .unwrap_or(run.phase);
            return Ok(if current.is_terminal() {
                ReconcileOutcome::AlreadyTerminal(current)
            } else {
                ReconcileOutcome::Unchanged(current)
            });
        }

        if target == RunPhase::Cancelled && run.kind == RunKind::Flow {
            self.cancel_open_steps(run_id).await?;
        }

        self.publish(run_id, run.kind, run.run_number, run.phase, target, &event);
        log_run_operation(
            operations::RECONCILE,
            run_id,
            Some(run.run_number),
            target.as_str(),
            Some(&format!("{} -> {} ({})", run.phase, target, event.event_type())),
        );

        Ok(ReconcileOutcome::Transitioned {
            from: run.phase,
            to: target,
        })
    }

    fn event_for(&self, run: &RunHandle, observed: RunPhase) -> RunEvent {
        if run.cancel_requested_at.is_none() {
            return RunEvent::Observed(observed);
        }

        let after_cancel = RunEvent::ObservedAfterCancel(observed);
        let resolves = RunStateMachine::determine_target_state(run.phase, &after_cancel)
            .is_some_and(|target| target.is_terminal());
        if !resolves && self.cancel_expired(run) {
            RunEvent::CancelTimedOut
        } else {
            after_cancel
        }
    }

    fn cancel_expired(&self, run: &RunHandle) -> bool {
        run.cancel_requested_at.is_some_and(|requested_at| {
            (Utc::now() - requested_at).to_std().unwrap_or_default() >= self.cancel_timeout
        })
    }

    async fn reconcile_steps(&self, flow_run_id: Uuid, status: &EngineStatus) -> Result<()> {
        let now = Utc::now();
        for step in self.store.list_flow_step_runs(flow_run_id).await? {
            let template = template_name_for(&step.step_id);
            let Some(unit) = latest_sub_unit(status, &template) else {
                continue;
            };

            let target = RunStateMachine::determine_target_state(
                step.phase,
                &RunEvent::Observed(sub_unit_phase(unit.phase)),
            );
            if target.is_none() && step.external_node_id.is_some() {
                continue;
            }

            let change = PhaseChange::entering(
                target.unwrap_or(step.phase),
                now,
                unit.started_at,
                unit.finished_at,
            );
            self.store
                .update_step_run(flow_run_id, &step.step_id, step.phase, &change, Some(&unit.id))
                .await?;
        }
        Ok(())
    }

    async fn cancel_open_steps(&self, flow_run_id: Uuid) -> Result<()> {
        let now = Utc::now();
        for step in self.store.list_flow_step_runs(flow_run_id).await? {
            if let Some(target) =
                RunStateMachine::determine_target_state(step.phase, &RunEvent::CancelTimedOut)
            {
                let change = PhaseChange::entering(target, now, None, None);
                self.store
                    .update_step_run(flow_run_id, &step.step_id, step.phase, &change, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Ask the engine to stop a run. Cancellation is cooperative; see [`CancelOutcome`].
    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("run", run_id))?;

        if run.phase.is_terminal() || !self.store.request_cancel(run_id, Utc::now()).await? {
            let phase = self
                .store
                .get_run(run_id)
                .await?
                .map(|r| r.phase)
                .unwrap_or(run.phase);
            return Ok(CancelOutcome::AlreadyTerminal(phase));
        }

        if let Some(job_id) = &run.external_job_id {
            if let Err(e) = self.engine.cancel(job_id).await {
                // the reconciler repeats the request and the timeout still applies
                warn!(%run_id, error = %e, "Stop request to engine failed");
            }
        }

        log_run_operation(
            operations::CANCEL,
            run_id,
            Some(run.run_number),
            run.phase.as_str(),
            Some("cancel requested"),
        );
        Ok(CancelOutcome::Requested)
    }

    /// Delete one run with its step runs and logs. Active jobs get a best-effort stop.
    pub async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("run", run_id))?;

        self.stop_if_active(&run).await;
        self.store.delete_run(run_id).await?;
        log_run_operation(
            operations::DELETE,
            run_id,
            Some(run.run_number),
            run.phase.as_str(),
            None,
        );
        Ok(())
    }

    /// Delete a task and everything recorded for it. Irreversible.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        for run in self.store.list_task_runs(task_id).await? {
            if let Some(handle) = self.store.get_run(run.task_run_id).await? {
                self.stop_if_active(&handle).await;
            }
        }
        if !self.store.delete_task(task_id).await? {
            return Err(FlowrunError::not_found("task", task_id));
        }
        debug!(%task_id, "Task deleted");
        Ok(())
    }

    /// Delete a flow and everything recorded for it. Irreversible.
    pub async fn delete_flow(&self, flow_id: Uuid) -> Result<()> {
        for run in self.store.list_flow_runs(flow_id).await? {
            if let Some(handle) = self.store.get_run(run.flow_run_id).await? {
                self.stop_if_active(&handle).await;
            }
        }
        if !self.store.delete_flow(flow_id).await? {
            return Err(FlowrunError::not_found("flow", flow_id));
        }
        debug!(%flow_id, "Flow deleted");
        Ok(())
    }

    async fn stop_if_active(&self, run: &RunHandle) {
        if run.phase.is_terminal() {
            return;
        }
        if let Some(job_id) = &run.external_job_id {
            if let Err(e) = self.engine.cancel(job_id).await {
                warn!(run_id = %run.run_id, error = %e, "Could not stop job of deleted run");
            }
        }
    }

    fn publish(
        &self,
        run_id: Uuid,
        kind: RunKind,
        run_number: i32,
        from: RunPhase,
        to: RunPhase,
        event: &RunEvent,
    ) {
        self.events.publish(PhaseTransition {
            run_id,
            kind,
            run_number,
            from,
            to,
            cause: event.event_type(),
            at: Utc::now(),
        });
    }
}
