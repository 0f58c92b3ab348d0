//! # session-pool-testing
//!
//! Test infrastructure for the session pool.
//!
//! [`MockSessionFactory`] is an in-memory [`SessionFactory`] whose behaviour
//! can be scripted per test: injected creation and transaction failures,
//! unhealthy sessions, failing deletions, artificial latency, and a gate
//! that holds creations until the test lets them through. It counts every
//! call so tests can assert on the exact traffic the pool generated.
//!
//! ## Example
//!
//! ```rust,ignore
//! use session_pool::{FactoryError, SessionPool};
//! use session_pool_testing::MockSessionFactory;
//!
//! let factory = MockSessionFactory::new();
//! factory.fail_next_creates(1, FactoryError::unavailable("injected"));
//!
//! let pool = SessionPool::builder(factory.clone()).build().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashSet;
use parking_lot::Mutex;
use session_pool::{
    DatabaseName, DynSessionFactory, FactoryError, HealthCheckResult, Session, SessionFactory,
    TransactionId,
};
use tokio::sync::Semaphore;

/// Scriptable in-memory session factory.
///
/// Cloning is cheap and every clone shares the same state, so a test can
/// keep one clone for assertions while the pool owns another.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    inner: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    ping_calls: AtomicU64,
    begin_calls: AtomicU64,
    next_transaction: AtomicU64,
    live: Mutex<HashSet<String>>,
    deleted: Mutex<Vec<String>>,
    create_failures: Mutex<VecDeque<FactoryError>>,
    begin_failures: Mutex<VecDeque<FactoryError>>,
    unhealthy: Mutex<HashSet<String>>,
    fail_deletes: AtomicBool,
    read_write_upgrade: AtomicBool,
    create_delay: Mutex<Duration>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockSessionFactory {
    /// Create a factory whose calls all succeed immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-erase a clone for [`SessionPool::builder`](session_pool::SessionPool::builder).
    #[must_use]
    pub fn shared(&self) -> DynSessionFactory {
        Arc::new(self.clone())
    }

    /// Allow `begin_read_write` on already-used read-only sessions.
    #[must_use]
    pub fn with_read_write_upgrade(self, enabled: bool) -> Self {
        self.inner.read_write_upgrade.store(enabled, Ordering::Relaxed);
        self
    }

    /// Delay every creation by `delay`.
    #[must_use]
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.inner.create_delay.lock() = delay;
        self
    }

    /// Fail the next `count` creations with `error`.
    pub fn fail_next_creates(&self, count: usize, error: FactoryError) {
        let mut failures = self.inner.create_failures.lock();
        failures.extend(std::iter::repeat_n(error, count));
    }

    /// Fail the next `begin_read_write` call with `error`.
    pub fn fail_next_begin(&self, error: FactoryError) {
        self.inner.begin_failures.lock().push_back(error);
    }

    /// Make pings of `session` report it as dead.
    pub fn mark_unhealthy(&self, session: &str) {
        self.inner.unhealthy.lock().insert(session.to_string());
    }

    /// Make every deletion fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.inner.fail_deletes.store(fail, Ordering::Relaxed);
    }

    /// Block creations until [`allow_creations`](Self::allow_creations) or
    /// [`open_creations`](Self::open_creations) lets them through.
    pub fn hold_creations(&self) {
        *self.inner.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held creations proceed.
    pub fn allow_creations(&self, count: usize) {
        if let Some(gate) = self.inner.gate.lock().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Stop holding creations and release every held one.
    pub fn open_creations(&self) {
        if let Some(gate) = self.inner.gate.lock().take() {
            gate.close();
        }
    }

    /// Number of `create_session` calls, including failed ones.
    #[must_use]
    pub fn create_calls(&self) -> u64 {
        self.inner.create_calls.load(Ordering::Relaxed)
    }

    /// Number of `delete_session` calls, including failed ones.
    #[must_use]
    pub fn delete_calls(&self) -> u64 {
        self.inner.delete_calls.load(Ordering::Relaxed)
    }

    /// Number of `ping_session` calls.
    #[must_use]
    pub fn ping_calls(&self) -> u64 {
        self.inner.ping_calls.load(Ordering::Relaxed)
    }

    /// Number of `begin_read_write` calls, including failed ones.
    #[must_use]
    pub fn begin_calls(&self) -> u64 {
        self.inner.begin_calls.load(Ordering::Relaxed)
    }

    /// Number of sessions created and not yet deleted upstream.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Names of successfully deleted sessions, in deletion order.
    #[must_use]
    pub fn deleted_sessions(&self) -> Vec<String> {
        self.inner.deleted.lock().clone()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create_session(&self, database: &DatabaseName) -> Result<String, FactoryError> {
        self.inner.create_calls.fetch_add(1, Ordering::Relaxed);

        let gate = self.inner.gate.lock().clone();
        if let Some(gate) = gate {
            // A closed gate means creations are no longer held.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let delay = *self.inner.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.inner.create_failures.lock().pop_front() {
            return Err(error);
        }

        let name = format!("{database}/sessions/{}", uuid::Uuid::new_v4().simple());
        self.inner.live.lock().insert(name.clone());
        tracing::trace!(session = %name, "mock session created");
        Ok(name)
    }

    async fn delete_session(&self, session: &Session) -> Result<(), FactoryError> {
        self.inner.delete_calls.fetch_add(1, Ordering::Relaxed);
        if self.inner.fail_deletes.load(Ordering::Relaxed) {
            return Err(FactoryError::unavailable("injected delete failure"));
        }
        self.inner.live.lock().remove(session.name());
        self.inner.deleted.lock().push(session.name().to_string());
        Ok(())
    }

    async fn ping_session(&self, session: &Session) -> HealthCheckResult {
        self.inner.ping_calls.fetch_add(1, Ordering::Relaxed);
        if self.inner.unhealthy.lock().contains(session.name()) {
            HealthCheckResult::Unhealthy("session expired".into())
        } else {
            HealthCheckResult::Healthy
        }
    }

    async fn begin_read_write(&self, session: &Session) -> Result<TransactionId, FactoryError> {
        self.inner.begin_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self.inner.begin_failures.lock().pop_front() {
            return Err(error);
        }
        let id = self.inner.next_transaction.fetch_add(1, Ordering::Relaxed);
        Ok(TransactionId::new(format!("{}/tx/{id}", session.name())))
    }

    fn supports_read_write_upgrade(&self) -> bool {
        self.inner.read_write_upgrade.load(Ordering::Relaxed)
    }
}

/// Install a test-friendly `tracing` subscriber once per process.
///
/// Output goes through the test harness capture, so it only shows for
/// failing tests or with `--nocapture`.
pub fn init_tracing(level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether the condition was met.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
