#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Flowrun Core
//!
//! Run orchestration and log synchronization for script tasks and step flows
//! executed on an external, Argo-compatible workflow engine.
//!
//! ## Overview
//!
//! Users author single-step **tasks** and multi-step **flows** (a DAG of
//! Python script steps). Every submission becomes a numbered **run** holding a
//! snapshot of exactly what executed. The engine runs jobs asynchronously and
//! reports partial status; this crate reconciles those reports into one
//! coherent run history and serves run logs from a persisted cache that is
//! kept in step with the engine.
//!
//! ## Architecture
//!
//! ```text
//! definition ─► compiler ─► RunLifecycleTracker ─► ExecutionEngine
//!                                 │   ▲                   │
//!                                 ▼   │ reconcile          │ status / logs
//!                              RunStore ◄─── LogSyncEngine ◄┘
//!                                                │
//!                                                ▼
//!                                           observers
//! ```
//!
//! The [`store::RunStore`] is the only state shared between submission,
//! reconciliation and log sync. Run numbers, phase transitions and log
//! upserts are all atomic store operations, so the background loops need no
//! global lock.
//!
//! ## Module Organization
//!
//! - [`compiler`] - Step scripts and DAG-to-job compilation with validation
//! - [`engine`] - Execution engine boundary and the Argo HTTP client
//! - [`orchestration`] - Submission, reconciliation, cancellation, deletion
//! - [`logs`] - Log cache, live streams and observer forwarding
//! - [`store`] - Persistence (in-memory and PostgreSQL)
//! - [`models`] - Tasks, flows, runs and log records
//! - [`state_machine`] - Run phases and their transition rules
//! - [`service`] - The operation set exposed to a front end
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowrun_core::config::FlowrunConfig;
//! use flowrun_core::models::{FlowDefinition, Step};
//! use flowrun_core::service::FlowrunService;
//!
//! # async fn example() -> flowrun_core::Result<()> {
//! let config = FlowrunConfig::load(Some("config/flowrun.toml"))?;
//! let service = FlowrunService::from_config(config).await?;
//!
//! let flow = service
//!     .create_flow(
//!         &FlowDefinition::new("answer")
//!             .with_step(Step::new("A", "y = 21"))
//!             .with_step(Step::new("B", "print(y*2)"))
//!             .with_edge("A", "B"),
//!     )
//!     .await?;
//! let detail = service.submit_flow(flow.flow_id).await?;
//! println!("flow run #{} submitted", detail.run.run_number);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit tests live next to the code; the `tests/` suites drive the service
//! against `test_helpers::MockEngine` and the in-memory store. The
//! `test_helpers` module only exists under `cfg(test)` or the `test-utils`
//! feature, which the integration suites enable through a dev-dependency.
//! PostgreSQL suites are ignored unless `DATABASE_URL` points at a test
//! database:
//!
//! ```bash
//! cargo test                                   # in-memory suites
//! DATABASE_URL=postgresql://... cargo test -- --ignored
//! ```

pub mod compiler;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod logging;
pub mod logs;
pub mod models;
pub mod orchestration;
pub mod service;
pub mod state_machine;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

pub use compiler::{CompiledFlow, DagCompiler, StepScriptBuilder};
pub use config::FlowrunConfig;
pub use engine::{ArgoEngineClient, EngineError, EnginePhase, ExecutionEngine, JobSpec};
pub use error::{FlowrunError, Result, ValidationError, ValidationErrorKind};
pub use logs::{LogSubscription, LogSyncEngine, LogUpdate};
pub use models::{
    Flow, FlowDefinition, FlowRun, FlowRunDetail, FlowStatus, LogEntry, RunOverrides, Step, Task,
    TaskDefinition, TaskRun,
};
pub use orchestration::{RunLifecycleTracker, RunReconciler};
pub use service::FlowrunService;
pub use state_machine::RunPhase;
pub use store::{InMemoryRunStore, PgRunStore, RunStore};
