//! # Postgres Run Store
//!
//! [`RunStore`] over the `flowrun_*` tables created by `migrations/`.
//!
//! ## Concurrency
//!
//! - Run numbers come from `UPDATE ... SET next_run_number = next_run_number + 1
//!   RETURNING`, executed in the same transaction as the run insert. The row
//!   lock serializes concurrent submissions per owner and a rolled back insert
//!   also rolls back the increment, so numbers stay gap free.
//! - Phase updates carry `WHERE phase = $expected` and never match a terminal row.
//! - The log upsert keeps the longer of the stored and incoming content in SQL.
//! - The log upsert share-locks its run row first and deletes remove run rows
//!   before log rows, so a record can never outlive its run.

use super::RunStore;
use crate::config::DatabaseConfig;
use crate::error::{FlowrunError, Result};
use crate::models::{
    DefinitionState, DependencySnapshot, Edge, Flow, FlowDefinition, FlowRun, FlowSnapshot,
    FlowStepRun, LogRecord, PhaseChange, RunHandle, RunKind, Step, Task, TaskDefinition, TaskRun,
};
use crate::state_machine::RunPhase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const TERMINAL_PHASES: &str = "('succeeded', 'failed', 'cancelled')";

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("✅ Database migrations applied");
        Ok(())
    }

    /// Run rows go first so that a log upsert holding the run row lock either
    /// commits before the log delete runs or finds the run gone.
    async fn delete_run_rows(tx: &mut Transaction<'_, Postgres>, run_id: Uuid) -> Result<bool> {
        let task_rows = sqlx::query("DELETE FROM flowrun_task_runs WHERE task_run_id = $1")
            .bind(run_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();

        // step runs go with the flow run via ON DELETE CASCADE
        let flow_rows = if task_rows > 0 {
            0
        } else {
            sqlx::query("DELETE FROM flowrun_flow_runs WHERE flow_run_id = $1")
                .bind(run_id)
                .execute(&mut **tx)
                .await?
                .rows_affected()
        };

        Self::delete_log_records(tx, &[run_id]).await?;
        Ok(task_rows + flow_rows > 0)
    }

    async fn delete_log_records(tx: &mut Transaction<'_, Postgres>, run_ids: &[Uuid]) -> Result<()> {
        sqlx::query("DELETE FROM flowrun_log_records WHERE run_id = ANY($1)")
            .bind(run_ids)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Share-lock the task run or flow run row with this id; false if neither exists.
    async fn lock_run_row(tx: &mut Transaction<'_, Postgres>, run_id: Uuid) -> Result<bool> {
        for (table, id_column) in RUN_TABLES {
            let found: Option<Uuid> = sqlx::query_scalar(&format!(
                "SELECT {id_column} FROM {table} WHERE {id_column} = $1 FOR SHARE"
            ))
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn parse_phase(raw: &str) -> Result<RunPhase> {
    raw.parse().map_err(FlowrunError::DatabaseError)
}

#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: Uuid,
    name: String,
    code: String,
    package_dependencies: Option<String>,
    requirements: Option<String>,
    system_dependencies: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            task_id: row.task_id,
            name: row.name,
            code: row.code,
            package_dependencies: row.package_dependencies,
            requirements: row.requirements,
            system_dependencies: row.system_dependencies,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TaskRunRow {
    task_run_id: Uuid,
    task_id: Uuid,
    run_number: i32,
    external_job_id: Option<String>,
    phase: String,
    code: String,
    package_dependencies: Option<String>,
    requirements: Option<String>,
    system_dependencies: Option<String>,
    error_message: Option<String>,
    cancel_requested_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskRunRow> for TaskRun {
    type Error = FlowrunError;

    fn try_from(row: TaskRunRow) -> Result<Self> {
        Ok(TaskRun {
            task_run_id: row.task_run_id,
            task_id: row.task_id,
            run_number: row.run_number,
            external_job_id: row.external_job_id,
            phase: parse_phase(&row.phase)?,
            snapshot: DependencySnapshot {
                code: row.code,
                package_dependencies: row.package_dependencies,
                requirements: row.requirements,
                system_dependencies: row.system_dependencies,
            },
            error_message: row.error_message,
            cancel_requested_at: row.cancel_requested_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FlowRow {
    flow_id: Uuid,
    name: String,
    steps: Json<Vec<Step>>,
    edges: Json<Vec<Edge>>,
    definition_state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FlowRow> for Flow {
    type Error = FlowrunError;

    fn try_from(row: FlowRow) -> Result<Self> {
        Ok(Flow {
            flow_id: row.flow_id,
            name: row.name,
            steps: row.steps.0,
            edges: row.edges.0,
            definition_state: row
                .definition_state
                .parse()
                .map_err(FlowrunError::DatabaseError)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FlowRunRow {
    flow_run_id: Uuid,
    flow_id: Uuid,
    run_number: i32,
    external_job_id: Option<String>,
    phase: String,
    snapshot: Json<FlowSnapshot>,
    error_message: Option<String>,
    cancel_requested_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<FlowRunRow> for FlowRun {
    type Error = FlowrunError;

    fn try_from(row: FlowRunRow) -> Result<Self> {
        Ok(FlowRun {
            flow_run_id: row.flow_run_id,
            flow_id: row.flow_id,
            run_number: row.run_number,
            external_job_id: row.external_job_id,
            phase: parse_phase(&row.phase)?,
            snapshot: row.snapshot.0,
            error_message: row.error_message,
            cancel_requested_at: row.cancel_requested_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StepRunRow {
    flow_step_run_id: Uuid,
    flow_run_id: Uuid,
    step_id: String,
    external_node_id: Option<String>,
    phase: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRunRow> for FlowStepRun {
    type Error = FlowrunError;

    fn try_from(row: StepRunRow) -> Result<Self> {
        Ok(FlowStepRun {
            flow_step_run_id: row.flow_step_run_id,
            flow_run_id: row.flow_run_id,
            step_id: row.step_id,
            external_node_id: row.external_node_id,
            phase: parse_phase(&row.phase)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunHandleRow {
    run_id: Uuid,
    kind: String,
    owner_id: Uuid,
    run_number: i32,
    external_job_id: Option<String>,
    phase: String,
    cancel_requested_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunHandleRow> for RunHandle {
    type Error = FlowrunError;

    fn try_from(row: RunHandleRow) -> Result<Self> {
        let kind = match row.kind.as_str() {
            "task" => RunKind::Task,
            "flow" => RunKind::Flow,
            other => {
                return Err(FlowrunError::DatabaseError(format!(
                    "Invalid run kind: {other}"
                )))
            }
        };
        Ok(RunHandle {
            run_id: row.run_id,
            kind,
            owner_id: row.owner_id,
            run_number: row.run_number,
            external_job_id: row.external_job_id,
            phase: parse_phase(&row.phase)?,
            cancel_requested_at: row.cancel_requested_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LogRecordRow {
    run_id: Uuid,
    step_id: String,
    pod_id: String,
    content: String,
    phase: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LogRecordRow> for LogRecord {
    type Error = FlowrunError;

    fn try_from(row: LogRecordRow) -> Result<Self> {
        Ok(LogRecord {
            run_id: row.run_id,
            step_id: row.step_id,
            pod_id: row.pod_id,
            content: row.content,
            phase: parse_phase(&row.phase)?,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = FlowrunError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const TASK_RUN_COLUMNS: &str = "task_run_id, task_id, run_number, external_job_id, phase, code, \
     package_dependencies, requirements, system_dependencies, error_message, \
     cancel_requested_at, started_at, finished_at, created_at";

const FLOW_RUN_COLUMNS: &str = "flow_run_id, flow_id, run_number, external_job_id, phase, \
     snapshot, error_message, cancel_requested_at, started_at, finished_at, created_at";

const RUN_HANDLE_SELECT: &str = "\
    SELECT task_run_id AS run_id, 'task' AS kind, task_id AS owner_id, run_number, \
           external_job_id, phase, cancel_requested_at, started_at, finished_at, created_at \
    FROM flowrun_task_runs WHERE {task_filter} \
    UNION ALL \
    SELECT flow_run_id AS run_id, 'flow' AS kind, flow_id AS owner_id, run_number, \
           external_job_id, phase, cancel_requested_at, started_at, finished_at, created_at \
    FROM flowrun_flow_runs WHERE {flow_filter}";

/// (table, id column) of both run tables
const RUN_TABLES: [(&str, &str); 2] = [
    ("flowrun_task_runs", "task_run_id"),
    ("flowrun_flow_runs", "flow_run_id"),
];

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_task(&self, definition: &TaskDefinition) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            "INSERT INTO flowrun_tasks (task_id, name, code, package_dependencies, requirements, \
             system_dependencies) VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING task_id, name, code, package_dependencies, requirements, \
             system_dependencies, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&definition.name)
        .bind(&definition.code)
        .bind(&definition.package_dependencies)
        .bind(&definition.requirements)
        .bind(&definition.system_dependencies)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn update_task(&self, task_id: Uuid, definition: &TaskDefinition) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            "UPDATE flowrun_tasks SET name = $2, code = $3, package_dependencies = $4, \
             requirements = $5, system_dependencies = $6, updated_at = now() \
             WHERE task_id = $1 \
             RETURNING task_id, name, code, package_dependencies, requirements, \
             system_dependencies, created_at, updated_at",
        )
        .bind(task_id)
        .bind(&definition.name)
        .bind(&definition.code)
        .bind(&definition.package_dependencies)
        .bind(&definition.requirements)
        .bind(&definition.system_dependencies)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Task::from)
            .ok_or_else(|| FlowrunError::not_found("task", task_id))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT task_id, name, code, package_dependencies, requirements, \
             system_dependencies, created_at, updated_at FROM flowrun_tasks WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Task::from))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT task_id, name, code, package_dependencies, requirements, \
             system_dependencies, created_at, updated_at FROM flowrun_tasks ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let run_ids: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM flowrun_task_runs WHERE task_id = $1 RETURNING task_run_id",
        )
        .bind(task_id)
        .fetch_all(&mut *tx)
        .await?;
        Self::delete_log_records(&mut tx, &run_ids).await?;
        let deleted = sqlx::query("DELETE FROM flowrun_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn create_flow(&self, definition: &FlowDefinition) -> Result<Flow> {
        let row = sqlx::query_as::<_, FlowRow>(
            "INSERT INTO flowrun_flows (flow_id, name, steps, edges, definition_state) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING flow_id, name, steps, edges, definition_state, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&definition.name)
        .bind(Json(&definition.steps))
        .bind(Json(&definition.edges))
        .bind(DefinitionState::Draft.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn update_flow(&self, flow_id: Uuid, definition: &FlowDefinition) -> Result<Flow> {
        let row = sqlx::query_as::<_, FlowRow>(
            "UPDATE flowrun_flows SET name = $2, steps = $3, edges = $4, \
             definition_state = $5, updated_at = now() WHERE flow_id = $1 \
             RETURNING flow_id, name, steps, edges, definition_state, created_at, updated_at",
        )
        .bind(flow_id)
        .bind(&definition.name)
        .bind(Json(&definition.steps))
        .bind(Json(&definition.edges))
        .bind(DefinitionState::Saved.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| FlowrunError::not_found("flow", flow_id))?
            .try_into()
    }

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<Flow>> {
        let row = sqlx::query_as::<_, FlowRow>(
            "SELECT flow_id, name, steps, edges, definition_state, created_at, updated_at \
             FROM flowrun_flows WHERE flow_id = $1",
        )
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Flow::try_from).transpose()
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        let rows = sqlx::query_as::<_, FlowRow>(
            "SELECT flow_id, name, steps, edges, definition_state, created_at, updated_at \
             FROM flowrun_flows ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn delete_flow(&self, flow_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let run_ids: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM flowrun_flow_runs WHERE flow_id = $1 RETURNING flow_run_id",
        )
        .bind(flow_id)
        .fetch_all(&mut *tx)
        .await?;
        Self::delete_log_records(&mut tx, &run_ids).await?;
        let deleted = sqlx::query("DELETE FROM flowrun_flows WHERE flow_id = $1")
            .bind(flow_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn create_task_run(&self, task_id: Uuid, snapshot: &DependencySnapshot) -> Result<TaskRun> {
        let mut tx = self.pool.begin().await?;

        let run_number: i32 = sqlx::query_scalar(
            "UPDATE flowrun_tasks SET next_run_number = next_run_number + 1 \
             WHERE task_id = $1 RETURNING next_run_number - 1",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| FlowrunError::not_found("task", task_id))?;

        let row = sqlx::query_as::<_, TaskRunRow>(&format!(
            "INSERT INTO flowrun_task_runs (task_run_id, task_id, run_number, phase, code, \
             package_dependencies, requirements, system_dependencies) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {TASK_RUN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(task_id)
        .bind(run_number)
        .bind(RunPhase::Pending.as_str())
        .bind(&snapshot.code)
        .bind(&snapshot.package_dependencies)
        .bind(&snapshot.requirements)
        .bind(&snapshot.system_dependencies)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn create_flow_run(
        &self,
        flow_id: Uuid,
        snapshot: &FlowSnapshot,
    ) -> Result<(FlowRun, Vec<FlowStepRun>)> {
        let mut tx = self.pool.begin().await?;

        let run_number: i32 = sqlx::query_scalar(
            "UPDATE flowrun_flows SET next_run_number = next_run_number + 1 \
             WHERE flow_id = $1 RETURNING next_run_number - 1",
        )
        .bind(flow_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| FlowrunError::not_found("flow", flow_id))?;

        let run: FlowRun = sqlx::query_as::<_, FlowRunRow>(&format!(
            "INSERT INTO flowrun_flow_runs (flow_run_id, flow_id, run_number, phase, snapshot) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {FLOW_RUN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(flow_id)
        .bind(run_number)
        .bind(RunPhase::Pending.as_str())
        .bind(Json(snapshot))
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

        let mut step_runs = Vec::with_capacity(snapshot.steps.len());
        for step in &snapshot.steps {
            let row = sqlx::query_as::<_, StepRunRow>(
                "INSERT INTO flowrun_flow_step_runs (flow_step_run_id, flow_run_id, step_id, phase) \
                 VALUES ($1, $2, $3, $4) RETURNING flow_step_run_id, flow_run_id, step_id, \
                 external_node_id, phase, started_at, finished_at",
            )
            .bind(Uuid::new_v4())
            .bind(run.flow_run_id)
            .bind(&step.step_id)
            .bind(RunPhase::Pending.as_str())
            .fetch_one(&mut *tx)
            .await?;
            step_runs.push(row.try_into()?);
        }

        tx.commit().await?;
        Ok((run, step_runs))
    }

    async fn get_task_run(&self, task_run_id: Uuid) -> Result<Option<TaskRun>> {
        let row = sqlx::query_as::<_, TaskRunRow>(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM flowrun_task_runs WHERE task_run_id = $1"
        ))
        .bind(task_run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRun::try_from).transpose()
    }

    async fn list_task_runs(&self, task_id: Uuid) -> Result<Vec<TaskRun>> {
        let rows = sqlx::query_as::<_, TaskRunRow>(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM flowrun_task_runs WHERE task_id = $1 \
             ORDER BY run_number DESC"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_flow_run(&self, flow_run_id: Uuid) -> Result<Option<FlowRun>> {
        let row = sqlx::query_as::<_, FlowRunRow>(&format!(
            "SELECT {FLOW_RUN_COLUMNS} FROM flowrun_flow_runs WHERE flow_run_id = $1"
        ))
        .bind(flow_run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FlowRun::try_from).transpose()
    }

    async fn list_flow_runs(&self, flow_id: Uuid) -> Result<Vec<FlowRun>> {
        let rows = sqlx::query_as::<_, FlowRunRow>(&format!(
            "SELECT {FLOW_RUN_COLUMNS} FROM flowrun_flow_runs WHERE flow_id = $1 \
             ORDER BY run_number DESC"
        ))
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_flow_step_runs(&self, flow_run_id: Uuid) -> Result<Vec<FlowStepRun>> {
        let rows = sqlx::query_as::<_, StepRunRow>(
            "SELECT flow_step_run_id, flow_run_id, step_id, external_node_id, phase, \
             started_at, finished_at FROM flowrun_flow_step_runs WHERE flow_run_id = $1 \
             ORDER BY step_id",
        )
        .bind(flow_run_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunHandle>> {
        let sql = RUN_HANDLE_SELECT
            .replace("{task_filter}", "task_run_id = $1")
            .replace("{flow_filter}", "flow_run_id = $1");
        let row = sqlx::query_as::<_, RunHandleRow>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunHandle::try_from).transpose()
    }

    async fn list_active_runs(&self) -> Result<Vec<RunHandle>> {
        let active = format!("phase NOT IN {TERMINAL_PHASES}");
        let sql = format!(
            "{} ORDER BY created_at",
            RUN_HANDLE_SELECT
                .replace("{task_filter}", &active)
                .replace("{flow_filter}", &active)
        );
        let rows = sqlx::query_as::<_, RunHandleRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn set_external_job_id(&self, run_id: Uuid, external_job_id: &str) -> Result<()> {
        for (table, id_column) in RUN_TABLES {
            let updated = sqlx::query(&format!(
                "UPDATE {table} SET external_job_id = $2 WHERE {id_column} = $1"
            ))
            .bind(run_id)
            .bind(external_job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if updated > 0 {
                return Ok(());
            }
        }
        Err(FlowrunError::not_found("run", run_id))
    }

    async fn update_run_phase(
        &self,
        run_id: Uuid,
        expected: RunPhase,
        change: &PhaseChange,
    ) -> Result<bool> {
        for (table, id_column) in RUN_TABLES {
            let updated = sqlx::query(&format!(
                "UPDATE {table} SET phase = $3, \
                 started_at = COALESCE(started_at, $4), \
                 finished_at = COALESCE(finished_at, $5), \
                 error_message = COALESCE($6, error_message) \
                 WHERE {id_column} = $1 AND phase = $2 AND phase NOT IN {TERMINAL_PHASES}"
            ))
            .bind(run_id)
            .bind(expected.as_str())
            .bind(change.phase.as_str())
            .bind(change.started_at)
            .bind(change.finished_at)
            .bind(&change.error_message)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if updated > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn request_cancel(&self, run_id: Uuid, requested_at: DateTime<Utc>) -> Result<bool> {
        for (table, id_column) in RUN_TABLES {
            let updated = sqlx::query(&format!(
                "UPDATE {table} SET cancel_requested_at = COALESCE(cancel_requested_at, $2) \
                 WHERE {id_column} = $1 AND phase NOT IN {TERMINAL_PHASES}"
            ))
            .bind(run_id)
            .bind(requested_at)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if updated > 0 {
                return Ok(true);
            }
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
        let updated = sqlx::query(&format!(
            "UPDATE flowrun_flow_step_runs SET phase = $4, \
             started_at = COALESCE(started_at, $5), \
             finished_at = COALESCE(finished_at, $6), \
             external_node_id = COALESCE(external_node_id, $7) \
             WHERE flow_run_id = $1 AND step_id = $2 AND phase = $3 \
             AND phase NOT IN {TERMINAL_PHASES}"
        ))
        .bind(flow_run_id)
        .bind(step_id)
        .bind(expected.as_str())
        .bind(change.phase.as_str())
        .bind(change.started_at)
        .bind(change.finished_at)
        .bind(external_node_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = Self::delete_run_rows(&mut tx, run_id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn get_log_records(&self, run_id: Uuid) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query_as::<_, LogRecordRow>(
            "SELECT run_id, step_id, pod_id, content, phase, updated_at \
             FROM flowrun_log_records WHERE run_id = $1 ORDER BY step_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn upsert_log_record(&self, record: &LogRecord) -> Result<LogRecord> {
        let mut tx = self.pool.begin().await?;
        if !Self::lock_run_row(&mut tx, record.run_id).await? {
            return Err(FlowrunError::not_found("run", record.run_id));
        }

        let row = sqlx::query_as::<_, LogRecordRow>(&format!(
            "INSERT INTO flowrun_log_records AS stored \
             (run_id, step_id, pod_id, content, phase, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (run_id, step_id) DO UPDATE SET \
               content = CASE WHEN octet_length(EXCLUDED.content) >= octet_length(stored.content) \
                              THEN EXCLUDED.content ELSE stored.content END, \
               phase = CASE WHEN stored.phase IN {TERMINAL_PHASES} \
                            THEN stored.phase ELSE EXCLUDED.phase END, \
               pod_id = CASE WHEN EXCLUDED.pod_id = '' THEN stored.pod_id ELSE EXCLUDED.pod_id END, \
               updated_at = GREATEST(stored.updated_at, EXCLUDED.updated_at) \
             RETURNING run_id, step_id, pod_id, content, phase, updated_at"
        ))
        .bind(record.run_id)
        .bind(&record.step_id)
        .bind(&record.pod_id)
        .bind(&record.content)
        .bind(record.phase.as_str())
        .bind(record.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }
}
