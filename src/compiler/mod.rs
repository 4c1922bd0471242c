//! # Job Compilation
//!
//! Turns task snapshots and flow graphs into [`crate::engine::JobSpec`]s.

pub mod dag;
pub mod script_builder;

pub use dag::{CompiledFlow, CompilerOptions, DagCompiler, ValidatedGraph};
pub use script_builder::{is_valid_step_id, ScriptInput, StepScriptBuilder};
