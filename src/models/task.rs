//! # Task Model
//!
//! A task is the logical single-step job a user keeps re-running. Every
//! submission creates a [`TaskRun`] holding a [`DependencySnapshot`] of what
//! actually executed, so later edits to the task never rewrite run history.

use crate::state_machine::RunPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub name: String,
    pub code: String,
    /// Whitespace or comma separated pip packages
    pub package_dependencies: Option<String>,
    /// Body of a requirements file; preferred over `package_dependencies`
    pub requirements: Option<String>,
    /// Whitespace or comma separated OS packages
    pub system_dependencies: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Editable fields of a task, used for both create and save
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub code: String,
    pub package_dependencies: Option<String>,
    pub requirements: Option<String>,
    pub system_dependencies: Option<String>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_package_dependencies(mut self, packages: impl Into<String>) -> Self {
        self.package_dependencies = Some(packages.into());
        self
    }

    pub fn with_requirements(mut self, requirements: impl Into<String>) -> Self {
        self.requirements = Some(requirements.into());
        self
    }

    pub fn with_system_dependencies(mut self, packages: impl Into<String>) -> Self {
        self.system_dependencies = Some(packages.into());
        self
    }
}

/// Code and dependency strings captured when a run is submitted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    pub code: String,
    pub package_dependencies: Option<String>,
    pub requirements: Option<String>,
    pub system_dependencies: Option<String>,
}

/// Per-submission values that take precedence over the task's stored fields.
/// Blank strings count as "not overridden".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOverrides {
    pub code: Option<String>,
    pub package_dependencies: Option<String>,
    pub requirements: Option<String>,
    pub system_dependencies: Option<String>,
}

impl RunOverrides {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_package_dependencies(mut self, packages: impl Into<String>) -> Self {
        self.package_dependencies = Some(packages.into());
        self
    }

    pub fn with_system_dependencies(mut self, packages: impl Into<String>) -> Self {
        self.system_dependencies = Some(packages.into());
        self
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl DependencySnapshot {
    /// Effective values for a fresh submission: override, else the task's stored value.
    pub fn resolve(task: &Task, overrides: &RunOverrides) -> Self {
        Self {
            code: overrides
                .code
                .as_ref()
                .filter(|c| !c.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| task.code.clone()),
            package_dependencies: non_blank(&overrides.package_dependencies)
                .or_else(|| non_blank(&task.package_dependencies)),
            requirements: non_blank(&overrides.requirements)
                .or_else(|| non_blank(&task.requirements)),
            system_dependencies: non_blank(&overrides.system_dependencies)
                .or_else(|| non_blank(&task.system_dependencies)),
        }
    }

    /// Effective values for re-running a previous run.
    ///
    /// Code and Python dependencies come from the previous snapshot; system
    /// dependencies always come from the task, never from the older run.
    pub fn for_rerun(previous: &DependencySnapshot, task: &Task, overrides: &RunOverrides) -> Self {
        Self {
            code: overrides
                .code
                .as_ref()
                .filter(|c| !c.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| previous.code.clone()),
            package_dependencies: non_blank(&overrides.package_dependencies)
                .or_else(|| non_blank(&previous.package_dependencies))
                .or_else(|| non_blank(&task.package_dependencies)),
            requirements: non_blank(&overrides.requirements)
                .or_else(|| non_blank(&previous.requirements))
                .or_else(|| non_blank(&task.requirements)),
            system_dependencies: non_blank(&overrides.system_dependencies)
                .or_else(|| non_blank(&task.system_dependencies)),
        }
    }
}

/// One execution attempt of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_run_id: Uuid,
    pub task_id: Uuid,
    pub run_number: i32,
    pub external_job_id: Option<String>,
    pub phase: RunPhase,
    pub snapshot: DependencySnapshot,
    pub error_message: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(packages: Option<&str>, system: Option<&str>) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            name: "report".to_string(),
            code: "print(1+1)".to_string(),
            package_dependencies: packages.map(str::to_string),
            requirements: None,
            system_dependencies: system.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_resolve_prefers_overrides() {
        let task = task_with(Some("numpy"), Some("libpq-dev"));
        let overrides = RunOverrides::none()
            .with_code("print(2)")
            .with_package_dependencies("pandas");

        let snapshot = DependencySnapshot::resolve(&task, &overrides);
        assert_eq!(snapshot.code, "print(2)");
        assert_eq!(snapshot.package_dependencies.as_deref(), Some("pandas"));
        assert_eq!(snapshot.system_dependencies.as_deref(), Some("libpq-dev"));
    }

    #[test]
    fn test_blank_override_keeps_task_value() {
        let task = task_with(Some("numpy"), None);
        let overrides = RunOverrides::none().with_package_dependencies("   ");

        let snapshot = DependencySnapshot::resolve(&task, &overrides);
        assert_eq!(snapshot.package_dependencies.as_deref(), Some("numpy"));
        assert_eq!(snapshot.code, "print(1+1)");
    }

    #[test]
    fn test_rerun_takes_system_dependencies_from_task() {
        let task = task_with(None, Some("graphviz"));
        let previous = DependencySnapshot {
            code: "print('old')".to_string(),
            package_dependencies: Some("numpy".to_string()),
            requirements: None,
            system_dependencies: Some("stale-package".to_string()),
        };

        let snapshot = DependencySnapshot::for_rerun(&previous, &task, &RunOverrides::none());
        assert_eq!(snapshot.code, "print('old')");
        assert_eq!(snapshot.package_dependencies.as_deref(), Some("numpy"));
        assert_eq!(snapshot.system_dependencies.as_deref(), Some("graphviz"));
    }
}
