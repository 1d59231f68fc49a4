use scylla::errors::{DbError, ExecutionError, PrepareError, RequestAttemptError};

// ============================================================================
// Store Errors & Write Outcomes
// ============================================================================
//
// Read paths return `Result<T, StoreError>` and surface only the genuinely
// fatal cases. Write paths return a `WriteOutcome` so callers can tell an
// ambiguous (transient) failure apart from a confirmed one.
//
// ============================================================================

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to connect to ScyllaDB: {0}")]
    Connection(String),

    #[error("timed out after {timeout_ms}ms waiting for initialization of '{key}'")]
    GateTimeout { key: String, timeout_ms: u128 },

    #[error("failed to prepare query template '{template}': {source}")]
    Prepare {
        template: &'static str,
        #[source]
        source: PrepareError,
    },

    #[error("query execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("failed to read result rows: {0}")]
    Rows(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted commit for aggregate {aggregate_id}: revision {revision}, position {position} ({reason})")]
    CorruptedCommit {
        aggregate_id: String,
        revision: i32,
        position: i32,
        reason: &'static str,
    },

    #[error("commit cannot be stored: {0}")]
    InvalidCommit(String),

    #[error("index record points to missing event {aggregate_id}@{revision}:{position}")]
    MissingIndexedEvent {
        aggregate_id: String,
        revision: i32,
        position: i32,
    },

    #[error("invalid pagination token: {0}")]
    InvalidCursor(String),
}

impl StoreError {
    pub(crate) fn rows(err: impl std::fmt::Display) -> Self {
        StoreError::Rows(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

// ============================================================================
// Failure Classification
// ============================================================================

/// How a driver failure should be treated by best-effort paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout-like failures where the write may or may not have landed.
    Transient,
    /// Everything else.
    Fatal,
}

pub fn classify_execution_error(error: &ExecutionError) -> FailureClass {
    match error {
        ExecutionError::LastAttemptError(RequestAttemptError::DbError(db_error, _)) => {
            match db_error {
                DbError::WriteTimeout { .. } | DbError::ReadTimeout { .. } => FailureClass::Transient,
                // Rejected by the coordinator before any replica was written.
                DbError::Unavailable { .. } | DbError::Overloaded => FailureClass::Fatal,
                _ => FailureClass::Fatal,
            }
        }
        ExecutionError::RequestTimeout(_) => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

/// Result of a best-effort write (append, delete, index insert).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Outcome unknown: the write may have been applied. Retry idempotently.
    TransientFailure(String),
    /// The write was rejected.
    Failed(String),
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }

    /// Map a driver result onto an outcome. Logging is left to the caller.
    pub fn from_execution<T>(result: std::result::Result<T, ExecutionError>) -> Self {
        match result {
            Ok(_) => WriteOutcome::Applied,
            Err(e) => Self::from_error(&e),
        }
    }

    pub fn from_error(error: &ExecutionError) -> Self {
        match classify_execution_error(error) {
            FailureClass::Transient => WriteOutcome::TransientFailure(error.to_string()),
            FailureClass::Fatal => WriteOutcome::Failed(error.to_string()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WriteOutcome::Applied => "applied",
            WriteOutcome::TransientFailure(_) => "transient_failure",
            WriteOutcome::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_timeout_is_transient() {
        let err = ExecutionError::RequestTimeout(Duration::from_secs(2));
        assert_eq!(classify_execution_error(&err), FailureClass::Transient);

        let outcome = WriteOutcome::from_execution::<()>(Err(err));
        assert!(matches!(outcome, WriteOutcome::TransientFailure(_)));
        assert!(!outcome.is_success());
        assert_eq!(outcome.label(), "transient_failure");
    }

    #[test]
    fn test_empty_plan_is_fatal() {
        let err = ExecutionError::EmptyPlan;
        assert_eq!(classify_execution_error(&err), FailureClass::Fatal);
        assert!(matches!(
            WriteOutcome::from_execution::<()>(Err(err)),
            WriteOutcome::Failed(_)
        ));
    }

    fn db_error(error: DbError) -> ExecutionError {
        ExecutionError::LastAttemptError(RequestAttemptError::DbError(error, "rejected".to_string()))
    }

    #[test]
    fn test_unavailable_is_fatal() {
        let err = db_error(DbError::Unavailable {
            consistency: scylla::statement::Consistency::Quorum,
            required: 2,
            alive: 1,
        });
        assert_eq!(classify_execution_error(&err), FailureClass::Fatal);
        assert!(matches!(WriteOutcome::from_error(&err), WriteOutcome::Failed(_)));
    }

    #[test]
    fn test_overloaded_is_fatal() {
        let err = db_error(DbError::Overloaded);
        assert_eq!(classify_execution_error(&err), FailureClass::Fatal);
    }

    #[test]
    fn test_applied_outcome() {
        let outcome = WriteOutcome::from_execution(Ok::<_, ExecutionError>(42));
        assert_eq!(outcome, WriteOutcome::Applied);
        assert!(outcome.is_success());
    }

    #[test]
    fn test_corrupted_commit_message() {
        let err = StoreError::CorruptedCommit {
            aggregate_id: "aa".to_string(),
            revision: 3,
            position: 2,
            reason: "unexpected position",
        };
        assert!(err.to_string().contains("revision 3, position 2"));
    }
}
