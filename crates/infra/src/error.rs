//! Storage and engine error types.
//!
//! `StoreError` is what a storage backend can report. `EngineError` is the
//! taxonomy callers of the engine see; every variant maps onto one
//! [`ErrorKind`] so an outer layer can translate it (HTTP status, RPC code)
//! without matching on details.

use thiserror::Error;

use stockflow_auth::AuthzError;
use stockflow_core::DomainError;

/// Storage boundary error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Waiting for a row lock exceeded the configured timeout (or the
    /// backend broke a deadlock).
    #[error("lock wait timed out on {0}")]
    LockTimeout(String),

    /// A concurrent writer won a race the backend detected at write time
    /// (unique violation, serialization failure).
    #[error("concurrent write conflict: {0}")]
    Contention(String),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    /// Internal lock poisoned by a panicking writer.
    #[error("store state poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }
}

/// Coarse error category exposed to callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PermissionDenied,
    InsufficientStock,
    Consistency,
    PartialFailure,
    Storage,
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Stale expected state or a transition not allowed from the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("concurrent write conflict: {0}")]
    Contention(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i64, requested: i64 },

    /// Ledger and snapshot (or a document and its ledger entries) disagree.
    #[error("consistency check failed for {subject}: {detail}")]
    Consistency { subject: String, detail: String },

    /// A multi-item step failed after some items had been processed. The unit
    /// of work was discarded, so nothing of it is visible.
    #[error("{operation} failed after {completed} of {total} items: {source}")]
    PartialFailure {
        operation: &'static str,
        completed: usize,
        total: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) | EngineError::LockTimeout(_) | EngineError::Contention(_) => {
                ErrorKind::Conflict
            }
            EngineError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            EngineError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            EngineError::Consistency { .. } => ErrorKind::Consistency,
            EngineError::PartialFailure { .. } => ErrorKind::PartialFailure,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Innermost error, looking through `PartialFailure` wrappers.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::PartialFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Lock contention is the only thing worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            EngineError::LockTimeout(_) | EngineError::Contention(_)
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn consistency(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Consistency {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    /// Wrap an item failure from a multi-item loop. Failing on the first item
    /// is not partial, so the error is returned unchanged.
    pub fn partial(operation: &'static str, completed: usize, total: usize, source: Self) -> Self {
        if completed == 0 {
            return source;
        }
        Self::PartialFailure {
            operation,
            completed,
            total,
            source: Box::new(source),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                EngineError::Validation(msg)
            }
            DomainError::NotFound(what) => EngineError::NotFound(what),
            DomainError::Conflict(msg) => EngineError::Conflict(msg),
            DomainError::InsufficientStock {
                available,
                requested,
            } => EngineError::InsufficientStock {
                available,
                requested,
            },
            DomainError::InvariantViolation(msg) => EngineError::Consistency {
                subject: "domain invariant".to_string(),
                detail: msg,
            },
            DomainError::Unauthorized => EngineError::PermissionDenied("unauthorized".to_string()),
        }
    }
}

impl From<AuthzError> for EngineError {
    fn from(err: AuthzError) -> Self {
        EngineError::PermissionDenied(err.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout(what) => EngineError::LockTimeout(what),
            StoreError::Contention(what) => EngineError::Contention(what),
            StoreError::Corrupt { table, message } => EngineError::Consistency {
                subject: table.to_string(),
                detail: message,
            },
            other @ (StoreError::Backend(_) | StoreError::Poisoned) => {
                EngineError::Storage(other.to_string())
            }
        }
    }
}
