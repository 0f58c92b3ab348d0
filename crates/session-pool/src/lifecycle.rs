//! Session lifecycle contract.
//!
//! The pool never talks to the backing store itself. Every network
//! operation on a session goes through a [`SessionFactory`], which the
//! client library implements on top of its RPC stubs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FactoryError;
use crate::session::{DatabaseName, Session, TransactionId};

/// Network operations the pool needs on remote sessions.
///
/// Implementations classify their failures with
/// [`FactoryErrorKind`](crate::FactoryErrorKind); the pool only ever
/// retries retryable failures, and only from maintenance.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// Create a session on `database` and return its server-issued name.
    async fn create_session(&self, database: &DatabaseName) -> Result<String, FactoryError>;

    /// Delete a session. Failures are logged by the pool, never surfaced.
    async fn delete_session(&self, session: &Session) -> Result<(), FactoryError>;

    /// Check that an idle session is still alive upstream.
    async fn ping_session(&self, session: &Session) -> HealthCheckResult;

    /// Begin a read/write transaction on a session.
    async fn begin_read_write(&self, session: &Session) -> Result<TransactionId, FactoryError>;

    /// Whether [`begin_read_write`](Self::begin_read_write) may be called on
    /// a session that has already been used read-only.
    ///
    /// When `false`, read-only and read/write sessions are strict partitions
    /// and a read/write request is never satisfied from the read-only queue.
    fn supports_read_write_upgrade(&self) -> bool {
        false
    }
}

/// Shared, type-erased session factory.
pub type DynSessionFactory = Arc<dyn SessionFactory>;

/// Outcome of a session ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckResult {
    /// The session is alive.
    Healthy,
    /// The session is gone or broken, with the reason reported upstream.
    Unhealthy(String),
}

impl HealthCheckResult {
    /// Whether the ping succeeded.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl From<Result<(), FactoryError>> for HealthCheckResult {
    fn from(result: Result<(), FactoryError>) -> Self {
        match result {
            Ok(()) => Self::Healthy,
            Err(e) => Self::Unhealthy(e.to_string()),
        }
    }
}
