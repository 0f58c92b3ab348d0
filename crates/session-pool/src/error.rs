//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::session::DatabaseName;

/// Classification of a failed [`SessionFactory`](crate::SessionFactory) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FactoryErrorKind {
    /// The backing store is temporarily unreachable.
    Unavailable,
    /// The backing store refused the request because a quota is exhausted.
    ResourceExhausted,
    /// The caller is not allowed to create or use sessions on the database.
    PermissionDenied,
    /// The session or database does not exist (anymore).
    NotFound,
    /// Any other failure reported by the backing store.
    Internal,
}

impl FactoryErrorKind {
    /// Whether a failure of this kind may succeed when retried later.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable | Self::ResourceExhausted)
    }
}

impl std::fmt::Display for FactoryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unavailable => "unavailable",
            Self::ResourceExhausted => "resource exhausted",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A classified failure returned by a [`SessionFactory`](crate::SessionFactory).
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct FactoryError {
    kind: FactoryErrorKind,
    message: String,
}

impl FactoryError {
    /// Create a new factory error.
    pub fn new(kind: FactoryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an [`FactoryErrorKind::Unavailable`] error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FactoryErrorKind::Unavailable, message)
    }

    /// Shorthand for a [`FactoryErrorKind::ResourceExhausted`] error.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(FactoryErrorKind::ResourceExhausted, message)
    }

    /// Shorthand for a [`FactoryErrorKind::PermissionDenied`] error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(FactoryErrorKind::PermissionDenied, message)
    }

    /// The classification of this error.
    #[must_use]
    pub fn kind(&self) -> FactoryErrorKind {
        self.kind
    }

    /// The message reported by the factory.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failed operation may succeed when retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors that can occur when using the session pool.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The session factory failed to create a session (or to begin its
    /// read/write transaction) for this request.
    #[error("session creation failed for {database}: {source}")]
    CreationFailed {
        /// Database the session was requested for.
        database: DatabaseName,
        /// The classified factory failure.
        #[source]
        source: FactoryError,
    },

    /// No session became available before the deadline.
    #[error("deadline exceeded after waiting {waited:?} for a session on {database}")]
    DeadlineExceeded {
        /// Database the session was requested for.
        database: DatabaseName,
        /// How long the request waited.
        waited: Duration,
    },

    /// The pool has been shut down.
    #[error("session pool is shut down")]
    Shutdown,

    /// The session was released although it is not currently leased.
    #[error("session {session} released twice or not leased from this pool")]
    DoubleRelease {
        /// Name of the offending session.
        session: String,
    },

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether retrying the failed `acquire` may succeed.
    ///
    /// Deadline expiry is retryable, as are creation failures whose factory
    /// classification is retryable. Everything else is terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CreationFailed { source, .. } => source.is_retryable(),
            Self::DeadlineExceeded { .. } => true,
            Self::Shutdown | Self::DoubleRelease { .. } | Self::Config(_) => false,
        }
    }

    pub(crate) fn creation_failed(database: &DatabaseName, source: FactoryError) -> Self {
        Self::CreationFailed {
            database: database.clone(),
            source,
        }
    }
}
