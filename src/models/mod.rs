pub mod flow;
pub mod log_record;
pub mod run;
pub mod task;

// Re-export core models for easy access
pub use flow::{
    DefinitionState, Edge, Flow, FlowDefinition, FlowRun, FlowRunDetail, FlowSnapshot, FlowStatus,
    FlowStepRun, Position, Step,
};
pub use log_record::{total_bytes, LogEntry, LogRecord};
pub use run::{PhaseChange, RunHandle, RunKind};
pub use task::{DependencySnapshot, RunOverrides, Task, TaskDefinition, TaskRun};
