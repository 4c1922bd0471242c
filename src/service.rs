//! # Flowrun Service
//!
//! The operation set exposed to a front end: task and flow definitions, run
//! submission and history, run detail, logs, preview, cancel and delete.
//! Everything here delegates to the [`RunStore`], the
//! [`RunLifecycleTracker`] and the [`LogSyncEngine`]; the service adds
//! not-found handling and the derived display status of tasks and flows.
//!
//! ```rust,no_run
//! use flowrun_core::config::FlowrunConfig;
//! use flowrun_core::models::{RunOverrides, TaskDefinition};
//! use flowrun_core::service::FlowrunService;
//!
//! # async fn example() -> flowrun_core::error::Result<()> {
//! let service = FlowrunService::from_config(FlowrunConfig::load(None::<&str>)?).await?;
//! let task = service.create_task(&TaskDefinition::new("sum", "print(1+1)")).await?;
//! let run = service.submit_task(task.task_id, &RunOverrides::none()).await?;
//! println!("submitted run #{} ({})", run.run_number, run.task_run_id);
//! # Ok(())
//! # }
//! ```

use crate::compiler::{CompilerOptions, DagCompiler};
use crate::config::FlowrunConfig;
use crate::engine::{ArgoEngineClient, ExecutionEngine};
use crate::error::{FlowrunError, Result};
use crate::logs::{LogSubscription, LogSyncEngine};
use crate::models::{
    Flow, FlowDefinition, FlowRun, FlowRunDetail, FlowStatus, LogEntry, RunHandle, RunOverrides,
    Task, TaskDefinition, TaskRun,
};
use crate::orchestration::{
    CancelOutcome, ReconcileOutcome, RunEventPublisher, RunLifecycleTracker, RunReconciler,
};
use crate::state_machine::RunPhase;
use crate::store::{InMemoryRunStore, PgRunStore, RunStore};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct FlowrunService {
    store: Arc<dyn RunStore>,
    tracker: Arc<RunLifecycleTracker>,
    logs: LogSyncEngine,
    config: FlowrunConfig,
}

impl std::fmt::Debug for FlowrunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowrunService")
            .field("tracker", &self.tracker)
            .field("logs", &self.logs)
            .finish_non_exhaustive()
    }
}

impl FlowrunService {
    pub fn new(
        store: Arc<dyn RunStore>,
        engine: Arc<dyn ExecutionEngine>,
        config: FlowrunConfig,
    ) -> Self {
        let compiler = DagCompiler::new(CompilerOptions::from(&config.engine));
        let tracker = RunLifecycleTracker::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            compiler,
            config.reconciler.cancel_timeout(),
        );
        let logs = LogSyncEngine::new(Arc::clone(&store), engine, config.log_sync.clone());

        Self {
            store,
            tracker: Arc::new(tracker),
            logs,
            config,
        }
    }

    /// Postgres store and Argo engine client built from configuration.
    pub async fn from_config(config: FlowrunConfig) -> Result<Self> {
        let store = PgRunStore::connect(&config.database).await?;
        let engine = ArgoEngineClient::new(&config.engine)?;
        info!(
            namespace = %config.engine.namespace,
            engine = %config.engine.base_url,
            "🚀 Flowrun service initialized"
        );
        Ok(Self::new(Arc::new(store), Arc::new(engine), config))
    }

    /// Service backed by an in-memory store; state is lost on exit.
    pub fn in_memory(engine: Arc<dyn ExecutionEngine>, config: FlowrunConfig) -> Self {
        Self::new(Arc::new(InMemoryRunStore::new()), engine, config)
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<RunLifecycleTracker> {
        &self.tracker
    }

    pub fn log_sync(&self) -> &LogSyncEngine {
        &self.logs
    }

    pub fn config(&self) -> &FlowrunConfig {
        &self.config
    }

    pub fn events(&self) -> &RunEventPublisher {
        self.tracker.events()
    }

    /// Background reconciler over this service's runs
    pub fn reconciler(&self) -> RunReconciler {
        RunReconciler::new(Arc::clone(&self.tracker), self.config.reconciler.clone())
    }

    // Tasks

    pub async fn create_task(&self, definition: &TaskDefinition) -> Result<Task> {
        self.store.create_task(definition).await
    }

    /// Save new task fields; existing runs keep their snapshots.
    pub async fn update_task(&self, task_id: Uuid, definition: &TaskDefinition) -> Result<Task> {
        self.store.update_task(task_id, definition).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("task", task_id))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.store.list_tasks().await
    }

    pub async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        self.tracker.delete_task(task_id).await
    }

    pub async fn submit_task(&self, task_id: Uuid, overrides: &RunOverrides) -> Result<TaskRun> {
        self.tracker.submit_task(task_id, overrides).await
    }

    pub async fn rerun_task(&self, task_run_id: Uuid, overrides: &RunOverrides) -> Result<TaskRun> {
        self.tracker.rerun_task(task_run_id, overrides).await
    }

    /// Runs of a task, latest first
    pub async fn list_task_runs(&self, task_id: Uuid) -> Result<Vec<TaskRun>> {
        self.get_task(task_id).await?;
        self.store.list_task_runs(task_id).await
    }

    pub async fn get_task_run(&self, task_run_id: Uuid) -> Result<TaskRun> {
        self.store
            .get_task_run(task_run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("task_run", task_run_id))
    }

    /// Displayed phase of a task: the phase of its latest run, if any
    pub async fn task_phase(&self, task_id: Uuid) -> Result<Option<RunPhase>> {
        Ok(self
            .list_task_runs(task_id)
            .await?
            .first()
            .map(|run| run.phase))
    }

    // Flows

    pub async fn create_flow(&self, definition: &FlowDefinition) -> Result<Flow> {
        self.store.create_flow(definition).await
    }

    /// Save a flow's steps and edges. Validation happens at submission, so a
    /// work-in-progress graph can be saved.
    pub async fn update_flow(&self, flow_id: Uuid, definition: &FlowDefinition) -> Result<Flow> {
        self.store.update_flow(flow_id, definition).await
    }

    pub async fn get_flow(&self, flow_id: Uuid) -> Result<Flow> {
        self.store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("flow", flow_id))
    }

    pub async fn list_flows(&self) -> Result<Vec<Flow>> {
        self.store.list_flows().await
    }

    pub async fn delete_flow(&self, flow_id: Uuid) -> Result<()> {
        self.tracker.delete_flow(flow_id).await
    }

    /// Coarse status derived from the flow's latest run
    pub async fn flow_status(&self, flow_id: Uuid) -> Result<FlowStatus> {
        let flow = self.get_flow(flow_id).await?;
        let latest = self.store.list_flow_runs(flow_id).await?;
        Ok(FlowStatus::derive(
            flow.definition_state,
            latest.first().map(|run| run.phase),
        ))
    }

    /// The manifest a flow definition would be submitted as, without submitting it.
    pub fn preview_flow(&self, definition: &FlowDefinition) -> Result<Value> {
        Ok(self
            .tracker
            .compiler()
            .preview(&definition.steps, &definition.edges)?)
    }

    pub async fn submit_flow(&self, flow_id: Uuid) -> Result<FlowRunDetail> {
        self.tracker.submit_flow(flow_id).await
    }

    /// Runs of a flow, latest first
    pub async fn list_flow_runs(&self, flow_id: Uuid) -> Result<Vec<FlowRun>> {
        self.get_flow(flow_id).await?;
        self.store.list_flow_runs(flow_id).await
    }

    pub async fn get_flow_run(&self, flow_run_id: Uuid) -> Result<FlowRunDetail> {
        self.tracker.flow_run_detail(flow_run_id).await
    }

    // Runs of either kind

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunHandle> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("run", run_id))
    }

    pub async fn reconcile(&self, run_id: Uuid) -> Result<ReconcileOutcome> {
        self.tracker.reconcile(run_id).await
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome> {
        self.tracker.cancel(run_id).await
    }

    pub async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        self.tracker.delete_run(run_id).await
    }

    pub async fn get_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>> {
        self.logs.get_logs(run_id).await
    }

    pub async fn stream_logs(&self, run_id: Uuid) -> Result<LogSubscription> {
        self.logs.stream_logs(run_id).await
    }
}
