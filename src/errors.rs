//! Typed error hierarchy for the Crucible engine.
//!
//! `EngineError` covers every failure a caller-initiated operation can
//! surface. Handoff rejection is split into its own layer so callers can
//! distinguish a malformed artifact (`SchemaError`) from a well-formed one
//! that contradicts current state (`SemanticError`).

use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Dependency cycle detected: {path}")]
    CycleDetected { path: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Lock contention on {resource} after {attempts} attempts")]
    ConcurrencyConflict { resource: String, attempts: u32 },

    #[error("Process error for worker {worker_id}: {message}")]
    Process { worker_id: String, message: String },

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Shorthand for the common unknown-id case.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<SchemaError> for EngineError {
    fn from(err: SchemaError) -> Self {
        EngineError::Validation(ValidationError::Schema(err))
    }
}

impl From<SemanticError> for EngineError {
    fn from(err: SemanticError) -> Self {
        EngineError::Validation(ValidationError::Semantic(err))
    }
}

/// Two-phase handoff rejection: schema first, then semantics.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Schema validation failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("Semantic validation failed: {0}")]
    Semantic(#[from] SemanticError),
}

/// The artifact itself is malformed: required fields absent or ill-typed.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("missing field '{field}'")]
    MissingField { field: &'static str },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("summary must be a single line of at most {max} characters (got {got})")]
    SummaryTooLong { max: usize, got: usize },

    #[error("body is {length} characters, below the minimum of {minimum}")]
    BodyTooShort { length: usize, minimum: usize },
}

/// The artifact is well-formed but contradicts current engine state.
#[derive(Debug, Error)]
pub enum SemanticError {
    #[error("task '{id}' does not exist")]
    UnknownTask { id: String },

    #[error("task '{id}' already exists")]
    DuplicateTask { id: String },

    #[error("status change {from} -> {to} is not legal for task '{id}'")]
    IllegalStatusChange {
        id: String,
        from: String,
        to: String,
    },

    #[error("a blocked handoff must name its blocker")]
    MissingBlockedReason,

    #[error("dependency '{dependency}' of task '{id}' is not satisfied")]
    InconsistentDependency { id: String, dependency: String },
}
