//! Session pool implementation.
//!
//! This module provides the top-level [`SessionPool`], which routes
//! acquisitions and releases to one [`DatabasePool`] per database and owns
//! the background maintenance of all of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, instant_after};
use crate::database::DatabasePool;
use crate::error::PoolError;
use crate::lifecycle::DynSessionFactory;
use crate::maintenance;
use crate::metrics::{MetricsRecorder, PoolMetrics};
use crate::session::{Capability, DatabaseName, Session};
use crate::statistics::Statistics;

/// A pool of sessions, partitioned by database.
///
/// Database pools are created lazily on first use and live until the
/// session pool is shut down. Each has its own lock, waiter queue and
/// maintenance loop, so databases never contend with each other.
///
/// # Example
///
/// ```rust,ignore
/// use session_pool::{Capability, DatabaseName, PoolConfig, SessionPool};
///
/// let pool = SessionPool::builder(factory)
///     .min_sessions(5)
///     .max_sessions(50)
///     .build()
///     .await?;
///
/// let db = DatabaseName::new("projects/p/instances/i/databases/d");
/// let session = pool.acquire(&db, Capability::ReadWrite).await?;
/// // Use session...
/// // Session automatically returned to the pool on drop
/// ```
pub struct SessionPool {
    default_config: PoolConfig,
    database_configs: HashMap<DatabaseName, PoolConfig>,
    factory: DynSessionFactory,
    databases: RwLock<HashMap<DatabaseName, Arc<DatabasePool>>>,
    closed: AtomicBool,
    maintenance: CancellationToken,
    metrics: Arc<MetricsRecorder>,
    runtime: Handle,
}

impl SessionPool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder(factory: DynSessionFactory) -> SessionPoolBuilder {
        SessionPoolBuilder::new(factory)
    }

    /// Create a new pool with the given default configuration.
    ///
    /// Must be called from within a Tokio runtime; maintenance and session
    /// deletions are spawned onto it.
    pub async fn new(factory: DynSessionFactory, config: PoolConfig) -> Result<Self, PoolError> {
        Self::builder(factory).pool_config(config).build().await
    }

    fn from_builder(builder: SessionPoolBuilder) -> Result<Self, PoolError> {
        builder.pool_config.validate()?;
        for config in builder.database_configs.values() {
            config.validate()?;
        }
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::Config("session pool must be created within a Tokio runtime".into())
        })?;

        tracing::info!(
            min = builder.pool_config.min_sessions,
            max = builder.pool_config.max_sessions,
            overrides = builder.database_configs.len(),
            "session pool created"
        );

        Ok(Self {
            default_config: builder.pool_config,
            database_configs: builder.database_configs,
            factory: builder.factory,
            databases: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            maintenance: CancellationToken::new(),
            metrics: Arc::new(MetricsRecorder::new()),
            runtime,
        })
    }

    /// Get a session for `database`, waiting at most the configured
    /// `acquire_timeout`.
    ///
    /// This will either return an idle session, create a new one if the
    /// database is below its maximum, or wait for a session to be released.
    pub async fn acquire(
        &self,
        database: &DatabaseName,
        capability: Capability,
    ) -> Result<PooledSession, PoolError> {
        let deadline = instant_after(Instant::now(), self.config_for(database).acquire_timeout);
        self.acquire_with_deadline(database, capability, deadline)
            .await
    }

    /// Get a session for `database`, waiting until `deadline` at most.
    ///
    /// An already elapsed deadline only succeeds if an idle session is
    /// available right away.
    pub async fn acquire_with_deadline(
        &self,
        database: &DatabaseName,
        capability: Capability,
        deadline: Instant,
    ) -> Result<PooledSession, PoolError> {
        let pool = self.database_pool(database)?;
        tracing::trace!(database = %database, %capability, "acquiring session");
        let session = pool.acquire(capability, deadline).await?;
        Ok(PooledSession::new(session, pool))
    }

    /// Try to get an idle session without waiting.
    ///
    /// Returns `None` if no matching session is idle right now.
    pub fn try_acquire(
        &self,
        database: &DatabaseName,
        capability: Capability,
    ) -> Result<Option<PooledSession>, PoolError> {
        let pool = self.database_pool(database)?;
        Ok(pool
            .try_acquire(capability)?
            .map(|session| PooledSession::new(session, pool)))
    }

    /// Return a session obtained through [`PooledSession::detach`].
    ///
    /// Fails with [`PoolError::DoubleRelease`] if the session is not
    /// currently leased. After shutdown this is a logged no-op.
    pub fn release(&self, session: Session) -> Result<(), PoolError> {
        if self.is_closed() {
            tracing::debug!(session = session.name(), "session released after shutdown");
            return Ok(());
        }
        let pool = self.databases.read().get(session.database()).cloned();
        match pool {
            Some(pool) => pool.release(session),
            None => Err(PoolError::DoubleRelease {
                session: session.name().to_string(),
            }),
        }
    }

    /// Create the database pool if needed and run one maintenance cycle on
    /// it, so that its warm minimum is available.
    pub async fn when_ready(&self, database: &DatabaseName) -> Result<(), PoolError> {
        let pool = self.database_pool(database)?;
        maintenance::run_cycle(&pool)
            .await
            .map_err(|e| PoolError::creation_failed(database, e))?;
        if self.is_closed() {
            return Err(PoolError::Shutdown);
        }
        Ok(())
    }

    /// Run one maintenance cycle on every database pool and wait for it.
    ///
    /// Failures are logged and backed off exactly as in the background loop.
    pub async fn run_maintenance(&self) {
        for pool in self.database_pools() {
            let _ = maintenance::run_cycle(&pool).await;
        }
    }

    /// Get a snapshot of the pool's current counters.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        let per_database = self
            .database_pools()
            .iter()
            .map(|pool| pool.statistics())
            .collect();
        Statistics::new(per_database)
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.snapshot()
    }

    /// Shut the pool down.
    ///
    /// Stops maintenance, fails every queued acquisition with
    /// [`PoolError::Shutdown`] and deletes idle and leased sessions. Deletion
    /// failures are logged only. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.maintenance.cancel();

        let pools = self.database_pools();
        tracing::info!(databases = pools.len(), "shutting down session pool");
        for pool in pools {
            pool.shutdown().await;
        }
        tracing::info!("session pool shut down");
    }

    /// Check if the pool is shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The configuration applied to `database`.
    #[must_use]
    pub fn config_for(&self, database: &DatabaseName) -> &PoolConfig {
        self.database_configs
            .get(database)
            .unwrap_or(&self.default_config)
    }

    fn database_pools(&self) -> Vec<Arc<DatabasePool>> {
        self.databases.read().values().cloned().collect()
    }

    /// Look up the database pool, creating it and its maintenance loop on
    /// first use.
    fn database_pool(&self, database: &DatabaseName) -> Result<Arc<DatabasePool>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Shutdown);
        }
        if let Some(pool) = self.databases.read().get(database) {
            return Ok(Arc::clone(pool));
        }

        let mut databases = self.databases.write();
        // Shutdown may have drained the map between the check and the lock.
        if self.is_closed() {
            return Err(PoolError::Shutdown);
        }
        let pool = databases.entry(database.clone()).or_insert_with(|| {
            let pool = Arc::new(DatabasePool::new(
                database.clone(),
                self.config_for(database).clone(),
                Arc::clone(&self.factory),
                Arc::clone(&self.metrics),
                self.runtime.clone(),
            ));
            maintenance::spawn(Arc::clone(&pool), self.maintenance.child_token());
            pool
        });
        Ok(Arc::clone(pool))
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("databases", &self.databases.read().len())
            .field("closed", &self.is_closed())
            .field("default_config", &self.default_config)
            .finish()
    }
}

/// Builder for creating a session pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = SessionPool::builder(factory)
///     .pool_config(PoolConfig::new().min_sessions(2))
///     .database_config("projects/p/instances/i/databases/hot", PoolConfig::new().max_sessions(400))
///     .build()
///     .await?;
/// ```
pub struct SessionPoolBuilder {
    factory: DynSessionFactory,
    pool_config: PoolConfig,
    database_configs: HashMap<DatabaseName, PoolConfig>,
}

impl SessionPoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new(factory: DynSessionFactory) -> Self {
        Self {
            factory,
            pool_config: PoolConfig::default(),
            database_configs: HashMap::new(),
        }
    }

    /// Set the default configuration for every database.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Override the configuration of one database.
    #[must_use]
    pub fn database_config(mut self, database: impl Into<DatabaseName>, config: PoolConfig) -> Self {
        self.database_configs.insert(database.into(), config);
        self
    }

    /// Set the default minimum number of warm sessions.
    #[must_use]
    pub fn min_sessions(mut self, count: u32) -> Self {
        self.pool_config.min_sessions = count;
        self
    }

    /// Set the default maximum number of sessions.
    #[must_use]
    pub fn max_sessions(mut self, count: u32) -> Self {
        self.pool_config.max_sessions = count;
        self
    }

    /// Set the default acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Set the default idle eviction timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the default maintenance interval.
    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.pool_config.maintenance_interval = interval;
        self
    }

    /// Build the pool.
    pub async fn build(self) -> Result<SessionPool, PoolError> {
        SessionPool::from_builder(self)
    }
}

/// A session leased from the pool.
///
/// When dropped, the session is automatically returned to its database
/// pool. Use [`detach()`](PooledSession::detach) to prevent automatic return.
pub struct PooledSession {
    session: Session,
    pool: Arc<DatabasePool>,
    returned: bool,
}

impl PooledSession {
    fn new(session: Session, pool: Arc<DatabasePool>) -> Self {
        Self {
            session,
            pool,
            returned: false,
        }
    }

    /// Get the leased session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Report the session as broken; it is deleted instead of reused.
    pub fn mark_invalid(&mut self) {
        self.session.mark_invalid();
    }

    /// Return the session to the pool now.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.returned = true;
        self.pool.release(self.session.clone())
    }

    /// Detach the session from the guard.
    ///
    /// The session stays leased; hand it back with
    /// [`SessionPool::release`] when done.
    #[must_use]
    pub fn detach(mut self) -> Session {
        self.returned = true;
        self.session.clone()
    }
}

impl std::ops::Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .finish()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        tracing::trace!(session = self.session.name(), "returning session to pool");
        if let Err(e) = self.pool.release(self.session.clone()) {
            tracing::warn!(session = self.session.name(), error = %e, "failed to return session");
        }
    }
}
