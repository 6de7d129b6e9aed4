// ABOUTME: Error taxonomy for the reconciliation core
// ABOUTME: Distinguishes retryable contention from fatal sequencing and consistency faults

use crate::store::EntityId;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the reconciliation core.
///
/// The retry machinery in `TransactionRunner` matches on these variants:
/// only `Contention` is ever retried, and only at lock acquisition or push.
/// Everything else propagates to the orchestrator, which cleans up and
/// reports through the `ErrorSink`.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Another writer holds a lock we need. Transient; retried up to a bound.
    #[error("lock contention on '{lock}'")]
    Contention { lock: String },

    /// A phase/lock-sequencing violation. Fatal and never retried: it means
    /// the orchestrator (or an embedder) called the core out of order.
    #[error("usage error: {0}")]
    Usage(String),

    /// A delete was rejected because a live relationship from outside the
    /// deleted subtree still references the entity. Not a failure; the
    /// deletion scanner treats it as a "still in use" skip signal.
    #[error("entity {entity} is still referenced and cannot be deleted")]
    ConstraintViolation { entity: EntityId },

    /// A tracked record points at a missing entity or ancestor. Fatal;
    /// indicates scope misconfiguration or a prior bug.
    #[error("consistency error in scope '{scope}': {message}")]
    Consistency { scope: String, message: String },

    /// The store or lock arbiter misbehaved in a way that is not contention.
    #[error("external failure: {0}")]
    External(String),
}

impl SyncError {
    pub fn contention(lock: impl Into<String>) -> Self {
        SyncError::Contention { lock: lock.into() }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        SyncError::Usage(message.into())
    }

    pub fn consistency(scope: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Consistency {
            scope: scope.into(),
            message: message.into(),
        }
    }

    pub fn external(message: impl Into<String>) -> Self {
        SyncError::External(message.into())
    }

    /// True if this error may be retried by the transaction runner.
    pub fn is_contention(&self) -> bool {
        matches!(self, SyncError::Contention { .. })
    }

    /// Short stable tag used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Contention { .. } => "contention",
            SyncError::Usage(_) => "usage",
            SyncError::ConstraintViolation { .. } => "constraint-violation",
            SyncError::Consistency { .. } => "consistency",
            SyncError::External(_) => "external",
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::External(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::External(format!("serialization failed: {err}"))
    }
}
