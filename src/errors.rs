//! Error taxonomy shared across every component boundary.
//!
//! Three kinds cross component boundaries: a message that will never succeed
//! (`Permanent`), an operation that may succeed on retry (`Transient`), and a
//! condition the process cannot continue past (`Fatal`). Every fallible
//! operation in this crate resolves to one of these.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Permanent,
    Transient,
    Fatal,
}

/// The error type threaded through the pipeline. `kind` drives DLQ/retry
/// routing; `dead_letter_reason`, when set, becomes the DLQ's
/// `deadLetterReason` message attribute.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct ProcessingError {
    pub kind: FailureKind,
    #[source]
    pub source: anyhow::Error,
    pub dead_letter_reason: Option<String>,
}

impl ProcessingError {
    pub fn permanent(reason: &str, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            source: source.into(),
            dead_letter_reason: Some(reason.to_string()),
        }
    }

    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Transient,
            source: source.into(),
            dead_letter_reason: None,
        }
    }

    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            source: source.into(),
            dead_letter_reason: None,
        }
    }
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;

/// Errors surfaced by the DB pool, independent of circuit-breaker state.
#[derive(Debug, Error)]
pub enum DbPoolError {
    #[error("no row found")]
    NotFound,
    /// A unique-constraint violation, most commonly the `dedup_key` index
    /// rejecting a redelivered insert. This is a business outcome of a
    /// healthy database, not an availability failure.
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),
    #[error("pool unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Query(#[from] sea_orm::DbErr),
}

impl DbPoolError {
    /// Only transport/connection-class failures trip the breaker; a row that
    /// simply doesn't exist, or a duplicate insert rejected by a unique
    /// index, is a business outcome, not an availability one.
    pub fn is_breaker_failure(&self) -> bool {
        !matches!(self, DbPoolError::NotFound | DbPoolError::UniqueViolation(_))
    }
}

impl From<sea_orm::DbErr> for ProcessingError {
    fn from(err: sea_orm::DbErr) -> Self {
        match &err {
            sea_orm::DbErr::RecordNotFound(_) => ProcessingError::permanent("not_found", err),
            _ => ProcessingError::transient(err),
        }
    }
}

impl From<DbPoolError> for ProcessingError {
    fn from(err: DbPoolError) -> Self {
        match &err {
            DbPoolError::NotFound => ProcessingError::permanent("not_found", err),
            DbPoolError::UniqueViolation(_) => ProcessingError::permanent("already_processed", err),
            DbPoolError::Unavailable(_) | DbPoolError::Query(_) => ProcessingError::transient(err),
        }
    }
}

/// Errors surfaced by the queue client's transport, independent of message
/// content.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),
    #[error("dead-letter send failed: {0}")]
    DeadLetterSendFailed(String),
}

/// Errors surfaced fetching or parsing a credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("unauthorized fetching secret")]
    Unauthorized,
    #[error("transport error fetching secret: {0}")]
    Transport(String),
}

/// Raised by the circuit breaker itself when it refuses a call outright.
#[derive(Debug, Error)]
#[error("circuit open")]
pub struct CircuitOpenError;
