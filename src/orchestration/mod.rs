//! # Run Orchestration
//!
//! Submission and reconciliation of task and flow runs.
//!
//! - [`RunLifecycleTracker`]: creates runs, submits jobs, reconciles phases,
//!   cancels and deletes
//! - [`RunReconciler`]: periodic reconciliation of every active run
//! - [`phase_resolver`]: the phase-determination rules applied to engine reports
//! - [`RunEventPublisher`]: in-process broadcast of applied transitions

pub mod events;
pub mod phase_resolver;
pub mod reconciler;
pub mod run_tracker;

pub use events::{PhaseTransition, RunEventPublisher};
pub use phase_resolver::{determine_run_phase, sub_unit_phase};
pub use reconciler::{ReconcileSummary, RunReconciler};
pub use run_tracker::{CancelOutcome, ReconcileOutcome, RunLifecycleTracker};
