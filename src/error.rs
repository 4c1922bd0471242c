//! Error types for the flowrun core.
//!

use crate::engine::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Category of a rejected task or flow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    /// An edge endpoint names a step that does not exist in the flow
    UnknownStepReference,
    /// The edge set contains a cycle or a self-loop
    CyclicDependency,
    /// Two steps share an id, or derive the same engine template name
    DuplicateStepId,
    /// A step id contains characters outside `[A-Za-z0-9_-]`
    InvalidStepId,
    /// A task or step has no code to run
    EmptyCode,
    /// A flow was submitted without any steps
    EmptyFlow,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownStepReference => "unknown_step_reference",
            Self::CyclicDependency => "cyclic_dependency",
            Self::DuplicateStepId => "duplicate_step_id",
            Self::InvalidStepId => "invalid_step_id",
            Self::EmptyCode => "empty_code",
            Self::EmptyFlow => "empty_flow",
        };
        f.write_str(name)
    }
}

/// A definition rejected before anything reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_step(edge_source: &str, edge_target: &str, missing: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnknownStepReference,
            format!("edge {edge_source} -> {edge_target} references unknown step '{missing}'"),
        )
    }

    pub fn cycle(step_id: &str) -> Self {
        Self::new(
            ValidationErrorKind::CyclicDependency,
            format!("cycle detected in step graph involving step '{step_id}'"),
        )
    }

    pub fn empty_code(owner: &str) -> Self {
        Self::new(
            ValidationErrorKind::EmptyCode,
            format!("{owner} has no code to run"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowrunError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FlowrunError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Kind of the validation failure, if this is one
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Self::Validation(err) => Some(err.kind),
            _ => None,
        }
    }

    /// Transient failures are retried by background loops on their next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_) | Self::DatabaseError(_))
    }
}

impl From<EngineError> for FlowrunError {
    fn from(error: EngineError) -> Self {
        FlowrunError::EngineUnavailable(error.to_string())
    }
}

impl From<sqlx::Error> for FlowrunError {
    fn from(error: sqlx::Error) -> Self {
        FlowrunError::DatabaseError(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for FlowrunError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        FlowrunError::DatabaseError(format!("migration failed: {error}"))
    }
}

impl From<serde_json::Error> for FlowrunError {
    fn from(error: serde_json::Error) -> Self {
        FlowrunError::Serialization(error.to_string())
    }
}

impl From<config::ConfigError> for FlowrunError {
    fn from(error: config::ConfigError) -> Self {
        FlowrunError::ConfigurationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowrunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_includes_kind() {
        let err = ValidationError::cycle("a");
        assert_eq!(
            err.to_string(),
            "cyclic_dependency: cycle detected in step graph involving step 'a'"
        );

        let wrapped: FlowrunError = err.into();
        assert_eq!(
            wrapped.validation_kind(),
            Some(ValidationErrorKind::CyclicDependency)
        );
        assert!(!wrapped.is_transient());
    }

    #[test]
    fn test_engine_error_is_transient() {
        let err: FlowrunError = EngineError::Transport("connection refused".to_string()).into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_not_found_message() {
        let err = FlowrunError::not_found("task_run", "abc");
        assert_eq!(err.to_string(), "task_run abc not found");
    }
}
