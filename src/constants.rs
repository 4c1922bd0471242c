//! # System Constants
//!
//! Fixed names and paths shared between the compiler, the engine binding and
//! the log synchronization engine.

/// Shared-volume layout used for inter-step data handoff
pub mod volume {
    /// Mount path of the shared volume inside every step container
    pub const SHARED_ROOT: &str = "/mnt/flowrun";
    /// Name of the volume claim template attached to multi-step jobs
    pub const VOLUME_NAME: &str = "flowrun-shared";
    /// File each step writes under `<SHARED_ROOT>/<step_id>/`
    pub const OUTPUT_FILE: &str = "output.json";
}

/// Engine job layout
pub mod job {
    /// Entrypoint template of every generated job
    pub const ENTRYPOINT: &str = "main";
    /// Step id used for the only step of a single-step task job
    pub const SINGLE_STEP_ID: &str = "main";
    /// Container whose output is collected as the step log
    pub const MAIN_CONTAINER: &str = "main";
    /// Prefix of per-step template names
    pub const STEP_TEMPLATE_PREFIX: &str = "step-";
}

/// Metadata labels attached to submitted jobs
pub mod labels {
    pub const OWNER_ID: &str = "flowrun/owner-id";
    pub const RUN_ID: &str = "flowrun/run-id";
    pub const RUN_NUMBER: &str = "flowrun/run-number";
    pub const KIND: &str = "flowrun/kind";
}

/// Operation names used in structured logs
pub mod operations {
    pub const SUBMIT_TASK: &str = "submit_task";
    pub const SUBMIT_FLOW: &str = "submit_flow";
    pub const RECONCILE: &str = "reconcile";
    pub const CANCEL: &str = "cancel";
    pub const DELETE: &str = "delete";
    pub const FETCH_LOGS: &str = "fetch_logs";
    pub const STREAM_LOGS: &str = "stream_logs";
}
