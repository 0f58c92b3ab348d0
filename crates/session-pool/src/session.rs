//! Session records and their capability tags.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

/// Identifier of a backing database, e.g.
/// `projects/p/instances/i/databases/d`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct DatabaseName(Arc<str>);

impl DatabaseName {
    /// Create a database name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DatabaseName {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

/// What a caller needs a session for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Capability {
    /// Reads and snapshot queries only.
    #[default]
    ReadOnly,
    /// Read/write transactions; the session carries a pre-begun transaction.
    ReadWrite,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("read-only"),
            Self::ReadWrite => f.write_str("read-write"),
        }
    }
}

/// Server-assigned marker of a transaction begun on a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(Arc<str>);

impl TransactionId {
    /// Create a transaction id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability tag of a session, with the transaction marker for read/write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// No transaction attached.
    ReadOnly,
    /// A read/write transaction has been begun on the session.
    ReadWrite {
        /// The begun transaction.
        transaction: TransactionId,
    },
}

impl SessionKind {
    /// The capability this kind provides.
    #[must_use]
    pub fn capability(&self) -> Capability {
        match self {
            Self::ReadOnly => Capability::ReadOnly,
            Self::ReadWrite { .. } => Capability::ReadWrite,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Owned by its database pool and available for lease.
    Idle,
    /// Owned by exactly one caller.
    Leased,
    /// Broken or expired; deleted instead of being reused.
    Invalid,
}

/// A remote session against one database.
///
/// The record is a token: cloning it does not create a second remote
/// session. The pool guarantees that a session name is leased to at most
/// one caller at a time; every lease is stamped with a fresh generation, so
/// a clone kept from an earlier lease is refused on release.
#[derive(Debug, Clone)]
pub struct Session {
    name: Arc<str>,
    database: DatabaseName,
    kind: SessionKind,
    state: SessionState,
    created_at: Instant,
    last_used_at: Instant,
    refreshed_at: Instant,
    lease: u64,
}

impl Session {
    /// Create a read-only record for a session the backing store just created.
    pub fn new(name: impl AsRef<str>, database: DatabaseName) -> Self {
        let now = Instant::now();
        Self {
            name: Arc::from(name.as_ref()),
            database,
            kind: SessionKind::ReadOnly,
            state: SessionState::Idle,
            created_at: now,
            last_used_at: now,
            refreshed_at: now,
            lease: 0,
        }
    }

    /// The name issued by the backing store.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database this session belongs to.
    #[must_use]
    pub fn database(&self) -> &DatabaseName {
        &self.database
    }

    /// The capability tag, including the transaction for read/write sessions.
    #[must_use]
    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    /// Shorthand for `self.kind().capability()`.
    #[must_use]
    pub fn capability(&self) -> Capability {
        self.kind.capability()
    }

    /// The pre-begun transaction of a read/write session.
    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionId> {
        match &self.kind {
            SessionKind::ReadOnly => None,
            SessionKind::ReadWrite { transaction } => Some(transaction),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session was marked invalid.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.state == SessionState::Invalid
    }

    /// Mark the session as broken. An invalid session is deleted on release.
    pub fn mark_invalid(&mut self) {
        self.state = SessionState::Invalid;
    }

    /// When the session was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the session was last returned to the pool.
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// When the session was last known alive upstream (use or ping).
    #[must_use]
    pub fn refreshed_at(&self) -> Instant {
        self.refreshed_at.max(self.last_used_at)
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Generation of the lease this record was handed out under; 0 if never
    /// leased.
    pub(crate) fn lease(&self) -> u64 {
        self.lease
    }

    pub(crate) fn set_lease(&mut self, lease: u64) {
        self.lease = lease;
    }

    pub(crate) fn set_read_write(&mut self, transaction: TransactionId) {
        self.kind = SessionKind::ReadWrite { transaction };
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
    }

    pub(crate) fn mark_refreshed(&mut self, now: Instant) {
        self.refreshed_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_read_only_and_idle() {
        let session = Session::new("s1", DatabaseName::new("db"));
        assert_eq!(session.capability(), Capability::ReadOnly);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.transaction().is_none());
    }

    #[test]
    fn test_read_write_tag_carries_transaction() {
        let mut session = Session::new("s1", DatabaseName::new("db"));
        session.set_read_write(TransactionId::new("tx-1"));

        assert_eq!(session.capability(), Capability::ReadWrite);
        assert_eq!(session.transaction().map(TransactionId::as_str), Some("tx-1"));
    }

    #[test]
    fn test_mark_invalid() {
        let mut session = Session::new("s1", DatabaseName::new("db"));
        session.mark_invalid();
        assert!(session.is_invalid());
    }

    #[test]
    fn test_database_name_serializes_as_string() {
        let name = DatabaseName::new("projects/p/instances/i/databases/d");
        assert_eq!(
            serde_json::to_string(&name).unwrap(),
            "\"projects/p/instances/i/databases/d\""
        );
    }

    #[test]
    fn test_refreshed_at_follows_last_use() {
        let mut session = Session::new("s1", DatabaseName::new("db"));
        let later = session.created_at() + std::time::Duration::from_secs(5);
        session.touch(later);
        assert_eq!(session.refreshed_at(), later);
    }
}
