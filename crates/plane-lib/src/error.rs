//! Error taxonomy for the control plane core
//!
//! Validation and admission failures are returned synchronously to the
//! caller. Everything that happens inside a wait task ends up in the
//! persisted task row through its updater.

use std::time::Duration;

use crate::scheduler::AdmissionError;

/// Result alias used throughout the core
pub type Result<T> = std::result::Result<T, Error>;

/// Control plane error kinds
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A looked-up entity does not exist
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// An entity with the same identity already exists
    #[error("{0} already exists")]
    Conflict(String),

    /// The request was rejected before any mutation
    #[error("validation failed: {0}")]
    Validation(String),

    /// The admission simulation could not fit the requests
    #[error(transparent)]
    InsufficientResource(#[from] AdmissionError),

    /// A polling deadline elapsed before the condition succeeded
    #[error("timed out after {after:?}: {what}")]
    Timeout { after: Duration, what: String },

    /// The task was cancelled by another operation
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A task's condition panicked
    #[error("internal fault: {0}")]
    Fault(String),

    /// Several independent sub-operations failed
    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    /// Transport or API failure reported by the orchestrator
    #[error("orchestrator: {0}")]
    Orchestrator(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn orchestrator(message: impl Into<String>) -> Self {
        Error::Orchestrator(message.into())
    }

    /// The persistence-layer "does not exist" sentinel
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Collapse a list of independent failures.
    ///
    /// No errors is success, a single error is returned as-is, more than
    /// one becomes [`Error::Aggregate`].
    pub fn collect(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Short machine-friendly label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Validation(_) => "validation",
            Error::InsufficientResource(_) => "insufficient_resource",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Fault(_) => "fault",
            Error::Aggregate(_) => "aggregate",
            Error::Orchestrator(_) => "orchestrator",
            Error::Internal(_) => "internal",
        }
    }
}
