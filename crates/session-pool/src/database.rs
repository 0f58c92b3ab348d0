//! Per-database pool state machine.
//!
//! All mutable state of one database lives in a single [`PoolState`]
//! behind a `parking_lot::Mutex`. The lock is only held for queue and
//! counter updates; every factory call runs outside of it, either on the
//! calling task or on a spawned one.
//!
//! Accounting: a session is in exactly one of the idle queues, the leased
//! index, or counted as in flight (being created, upgraded or pinged).
//! `idle + leased + in_flight <= max_sessions` holds after every update.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::{FactoryError, PoolError};
use crate::lifecycle::{DynSessionFactory, HealthCheckResult};
use crate::maintenance::TopUpBackoff;
use crate::metrics::MetricsRecorder;
use crate::session::{Capability, DatabaseName, Session, SessionState};
use crate::statistics::DatabaseStatistics;

type Reply = oneshot::Sender<Result<Session, PoolError>>;

fn other_class(capability: Capability) -> Capability {
    match capability {
        Capability::ReadOnly => Capability::ReadWrite,
        Capability::ReadWrite => Capability::ReadOnly,
    }
}

/// A caller queued for a session.
struct Waiter {
    id: u64,
    capability: Capability,
    enqueued_at: Instant,
    reply: Reply,
}

impl Waiter {
    fn accepts(&self, offered: Capability, reuse_read_write: bool) -> bool {
        match (self.capability, offered) {
            (Capability::ReadOnly, Capability::ReadOnly)
            | (Capability::ReadWrite, Capability::ReadWrite) => true,
            (Capability::ReadOnly, Capability::ReadWrite) => reuse_read_write,
            (Capability::ReadWrite, Capability::ReadOnly) => false,
        }
    }
}

/// A failed creation. `session` is set when the session was created but
/// beginning its read/write transaction failed.
struct CreateFailure {
    error: FactoryError,
    session: Option<Session>,
}

#[derive(Default)]
struct PoolState {
    /// Idle read-only sessions, ordered by `last_used_at`; the back is the
    /// most recently returned.
    idle_read_only: VecDeque<Session>,
    /// Idle read/write sessions, same ordering.
    idle_read_write: VecDeque<Session>,
    /// Leased sessions by name, each holding its current lease generation.
    leased: HashMap<Arc<str>, Session>,
    /// Last lease generation handed out.
    lease_seq: u64,
    /// Creations, upgrades and pings in progress.
    in_flight: u32,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl PoolState {
    fn idle_count(&self) -> u32 {
        (self.idle_read_only.len() + self.idle_read_write.len()) as u32
    }

    fn total(&self) -> u32 {
        self.idle_count() + self.leased.len() as u32 + self.in_flight
    }

    fn idle_queue(&mut self, capability: Capability) -> &mut VecDeque<Session> {
        match capability {
            Capability::ReadOnly => &mut self.idle_read_only,
            Capability::ReadWrite => &mut self.idle_read_write,
        }
    }

    /// Pop the most recently returned idle session usable for `capability`.
    fn take_idle(&mut self, capability: Capability, reuse_read_write: bool) -> Option<Session> {
        match capability {
            Capability::ReadWrite => self.idle_read_write.pop_back(),
            Capability::ReadOnly => self.idle_read_only.pop_back().or_else(|| {
                if reuse_read_write {
                    self.idle_read_write.pop_back()
                } else {
                    None
                }
            }),
        }
    }

    /// Insert an idle session keeping the queue ordered by last use.
    fn push_idle(&mut self, mut session: Session) {
        session.set_state(SessionState::Idle);
        let queue = self.idle_queue(session.capability());
        let at = queue.partition_point(|s| s.last_used_at() <= session.last_used_at());
        queue.insert(at, session);
    }

    fn lease(&mut self, mut session: Session) -> Session {
        self.lease_seq += 1;
        session.set_lease(self.lease_seq);
        session.set_state(SessionState::Leased);
        self.leased.insert(session.shared_name(), session.clone());
        session
    }

    /// Drop `session` from the leased index if it belongs to the current
    /// lease of its name. A clone from an earlier lease does not.
    fn end_lease(&mut self, session: &Session) -> bool {
        let current = self
            .leased
            .get(session.name())
            .is_some_and(|leased| leased.lease() == session.lease());
        if current {
            self.leased.remove(session.name());
        }
        current
    }

    /// Hand a session to a waiting caller. Gives the session back if the
    /// caller stopped waiting.
    fn deliver(&mut self, reply: Reply, session: Session) -> Result<(), Session> {
        let name = session.shared_name();
        let session = self.lease(session);
        match reply.send(Ok(session)) {
            Ok(()) => Ok(()),
            Err(returned) => {
                self.leased.remove(&name);
                match returned {
                    Ok(session) => Err(session),
                    Err(_) => Ok(()),
                }
            }
        }
    }

    /// Offer a session to the longest-waiting caller that accepts it.
    fn offer_to_waiters(&mut self, mut session: Session, reuse_read_write: bool) -> Result<(), Session> {
        while let Some(pos) = self
            .waiters
            .iter()
            .position(|w| w.accepts(session.capability(), reuse_read_write))
        {
            let Some(waiter) = self.waiters.remove(pos) else {
                break;
            };
            tracing::trace!(
                session = session.name(),
                waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                "handing session to waiter"
            );
            match self.deliver(waiter.reply, session) {
                Ok(()) => return Ok(()),
                Err(returned) => session = returned,
            }
        }
        Err(session)
    }
}

/// Session pool of a single database.
pub(crate) struct DatabasePool {
    database: DatabaseName,
    config: PoolConfig,
    factory: DynSessionFactory,
    metrics: Arc<MetricsRecorder>,
    runtime: Handle,
    state: Mutex<PoolState>,
    backoff: Mutex<TopUpBackoff>,
    next_waiter_id: AtomicU64,
}

impl DatabasePool {
    pub(crate) fn new(
        database: DatabaseName,
        config: PoolConfig,
        factory: DynSessionFactory,
        metrics: Arc<MetricsRecorder>,
        runtime: Handle,
    ) -> Self {
        tracing::debug!(
            database = %database,
            min = config.min_sessions,
            max = config.max_sessions,
            "database pool created"
        );
        Self {
            database,
            config,
            factory,
            metrics,
            runtime,
            state: Mutex::new(PoolState::default()),
            backoff: Mutex::new(TopUpBackoff::default()),
            next_waiter_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn database(&self) -> &DatabaseName {
        &self.database
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn factory(&self) -> &DynSessionFactory {
        &self.factory
    }

    pub(crate) fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn backoff(&self) -> &Mutex<TopUpBackoff> {
        &self.backoff
    }

    /// Lease a session, waiting until `deadline` if none is available.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        capability: Capability,
        deadline: Instant,
    ) -> Result<Session, PoolError> {
        let result = self.acquire_inner(capability, deadline).await;
        self.metrics.record_checkout(result.is_ok());
        result
    }

    async fn acquire_inner(
        self: &Arc<Self>,
        capability: Capability,
        deadline: Instant,
    ) -> Result<Session, PoolError> {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        let mut waiter_id = None;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Shutdown);
            }

            if let Some(session) =
                state.take_idle(capability, self.config.reuse_read_write_for_read_only)
            {
                tracing::trace!(
                    database = %self.database,
                    session = session.name(),
                    %capability,
                    "leased idle session"
                );
                return Ok(state.lease(session));
            }

            if deadline <= started {
                return Err(PoolError::DeadlineExceeded {
                    database: self.database.clone(),
                    waited: std::time::Duration::ZERO,
                });
            }

            let upgradable = if capability == Capability::ReadWrite
                && self.factory.supports_read_write_upgrade()
            {
                state.idle_read_only.pop_back()
            } else {
                None
            };

            if let Some(session) = upgradable {
                state.in_flight += 1;
                self.spawn_upgrade(session, tx);
            } else if state.total() < self.config.max_sessions {
                state.in_flight += 1;
                self.spawn_create(capability, Some(tx));
            } else if let Some(unusable) = state.idle_queue(other_class(capability)).pop_front() {
                // Full, but an idle session of the other class can make room.
                tracing::trace!(
                    database = %self.database,
                    session = unusable.name(),
                    %capability,
                    "replacing idle session of the other class"
                );
                state.in_flight += 1;
                self.schedule_delete(unusable);
                self.spawn_create(capability, Some(tx));
            } else {
                let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                state.waiters.push_back(Waiter {
                    id,
                    capability,
                    enqueued_at: started,
                    reply: tx,
                });
                waiter_id = Some(id);
                tracing::trace!(
                    database = %self.database,
                    %capability,
                    pending = state.waiters.len(),
                    "pool exhausted, queued acquisition"
                );
            }
        }

        PendingAcquire {
            pool: Arc::clone(self),
            waiter_id,
            rx,
            completed: false,
        }
        .wait(deadline, started)
        .await
    }

    /// Lease an idle session without waiting or creating.
    pub(crate) fn try_acquire(&self, capability: Capability) -> Result<Option<Session>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Shutdown);
        }
        let session = state
            .take_idle(capability, self.config.reuse_read_write_for_read_only)
            .map(|session| state.lease(session));
        if session.is_some() {
            self.metrics.record_checkout(true);
        }
        Ok(session)
    }

    /// Return a leased session.
    pub(crate) fn release(self: &Arc<Self>, mut session: Session) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            tracing::debug!(
                database = %self.database,
                session = session.name(),
                "session released after shutdown"
            );
            return Ok(());
        }
        if !state.end_lease(&session) {
            tracing::warn!(
                database = %self.database,
                session = session.name(),
                "release of a session that is not leased"
            );
            return Err(PoolError::DoubleRelease {
                session: session.name().to_string(),
            });
        }

        if session.is_invalid() {
            tracing::debug!(
                database = %self.database,
                session = session.name(),
                "discarding invalid session"
            );
            self.schedule_delete(session);
            self.serve_waiters(&mut state);
            return Ok(());
        }

        tracing::trace!(database = %self.database, session = session.name(), "session released");
        session.touch(Instant::now());
        self.dispatch(&mut state, session);
        Ok(())
    }

    /// Take back a session that was handed to a caller who gave up.
    fn reclaim(self: &Arc<Self>, session: Session) {
        let mut state = self.state.lock();
        if !state.end_lease(&session) {
            return;
        }
        if state.closed {
            drop(state);
            self.schedule_delete(session);
            return;
        }
        self.dispatch(&mut state, session);
    }

    fn remove_waiter(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
        }
    }

    /// Route an available session: to the oldest matching waiter, to a
    /// read/write waiter through an upgrade, in exchange for a fresh session
    /// of the class the oldest remaining waiter needs, or to its idle queue.
    fn dispatch(self: &Arc<Self>, state: &mut PoolState, session: Session) {
        if state.closed {
            self.schedule_delete(session);
            return;
        }

        let session =
            match state.offer_to_waiters(session, self.config.reuse_read_write_for_read_only) {
                Ok(()) => return,
                Err(session) => session,
            };

        if session.capability() == Capability::ReadOnly && self.factory.supports_read_write_upgrade()
        {
            let pos = state
                .waiters
                .iter()
                .position(|w| w.capability == Capability::ReadWrite);
            if let Some(waiter) = pos.and_then(|pos| state.waiters.remove(pos)) {
                state.in_flight += 1;
                self.spawn_upgrade(session, waiter.reply);
                return;
            }
        }

        // Remaining waiters all need the other class.
        if let Some(waiter) = state.waiters.pop_front() {
            tracing::trace!(
                database = %self.database,
                session = session.name(),
                capability = %waiter.capability,
                "replacing session for a waiter of the other class"
            );
            state.in_flight += 1;
            self.schedule_delete(session);
            self.spawn_create(waiter.capability, Some(waiter.reply));
            return;
        }

        state.push_idle(session);
    }

    /// Dispatch creations for queued callers while there is room.
    fn serve_waiters(self: &Arc<Self>, state: &mut PoolState) {
        while state.total() < self.config.max_sessions {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.reply.is_closed() {
                continue;
            }
            state.in_flight += 1;
            self.spawn_create(waiter.capability, Some(waiter.reply));
        }
    }

    /// Create a session on a spawned task. The caller must already have
    /// counted it as in flight.
    fn spawn_create(self: &Arc<Self>, capability: Capability, reply: Option<Reply>) {
        let pool = Arc::clone(self);
        self.runtime.spawn(async move {
            // Failures are reported to `reply`.
            let _ = pool.create_and_dispatch(capability, reply).await;
        });
    }

    /// Create a session and route it. The caller must already have counted
    /// it as in flight.
    pub(crate) async fn create_and_dispatch(
        self: Arc<Self>,
        capability: Capability,
        reply: Option<Reply>,
    ) -> Result<(), FactoryError> {
        let result = self.open_session(capability).await;
        let mut state = self.state.lock();
        state.in_flight -= 1;

        match result {
            Ok(session) => {
                tracing::debug!(
                    database = %self.database,
                    session = session.name(),
                    %capability,
                    "session created"
                );
                if state.closed {
                    drop(state);
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(PoolError::Shutdown));
                    }
                    self.schedule_delete(session);
                    return Ok(());
                }
                let surplus = match reply {
                    Some(reply) => state.deliver(reply, session).err(),
                    None => Some(session),
                };
                if let Some(session) = surplus {
                    self.dispatch(&mut state, session);
                }
                Ok(())
            }
            Err(failure) => {
                self.metrics.record_creation_failed();
                tracing::debug!(
                    database = %self.database,
                    error = %failure.error,
                    "session creation failed"
                );
                if let Some(reply) = reply {
                    let _ = reply.send(Err(PoolError::creation_failed(
                        &self.database,
                        failure.error.clone(),
                    )));
                }
                match failure.session {
                    // Keep it as a read-only session.
                    Some(session) => self.dispatch(&mut state, session),
                    None => self.serve_waiters(&mut state),
                }
                Err(failure.error)
            }
        }
    }

    async fn open_session(&self, capability: Capability) -> Result<Session, CreateFailure> {
        let name = self
            .factory
            .create_session(&self.database)
            .await
            .map_err(|error| CreateFailure {
                error,
                session: None,
            })?;
        self.metrics.record_created();

        let mut session = Session::new(name, self.database.clone());
        if capability == Capability::ReadWrite {
            match self.factory.begin_read_write(&session).await {
                Ok(transaction) => session.set_read_write(transaction),
                Err(error) => {
                    return Err(CreateFailure {
                        error,
                        session: Some(session),
                    });
                }
            }
        }
        Ok(session)
    }

    /// Begin a read/write transaction on an idle read-only session for a
    /// specific caller. The caller must already have counted it as in flight.
    fn spawn_upgrade(self: &Arc<Self>, mut session: Session, reply: Reply) {
        let pool = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = pool.factory.begin_read_write(&session).await;
            let mut state = pool.state.lock();
            state.in_flight -= 1;
            match result {
                Ok(transaction) => {
                    session.set_read_write(transaction);
                    if state.closed {
                        drop(state);
                        let _ = reply.send(Err(PoolError::Shutdown));
                        pool.schedule_delete(session);
                    } else if let Err(session) = state.deliver(reply, session) {
                        pool.dispatch(&mut state, session);
                    }
                }
                Err(error) => {
                    pool.metrics.record_creation_failed();
                    let _ = reply.send(Err(PoolError::creation_failed(&pool.database, error)));
                    pool.dispatch(&mut state, session);
                }
            }
        });
    }

    /// Remove idle sessions unused for longer than the idle timeout, oldest
    /// first, without dropping below the minimum.
    pub(crate) fn evict_idle(self: &Arc<Self>, now: Instant) -> Vec<Session> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }

        let mut excess = state.total().saturating_sub(self.config.min_sessions);
        let expired = |s: Option<&Session>| {
            s.filter(|s| now.saturating_duration_since(s.last_used_at()) >= self.config.idle_timeout)
                .map(Session::last_used_at)
        };

        let mut evicted = Vec::new();
        while excess > 0 {
            let read_only = expired(state.idle_read_only.front());
            let read_write = expired(state.idle_read_write.front());
            let next = match (read_only, read_write) {
                (Some(a), Some(b)) if b < a => state.idle_read_write.pop_front(),
                (Some(_), _) => state.idle_read_only.pop_front(),
                (None, Some(_)) => state.idle_read_write.pop_front(),
                (None, None) => None,
            };
            let Some(session) = next else {
                break;
            };
            evicted.push(session);
            excess -= 1;
        }
        if !evicted.is_empty() {
            self.serve_waiters(&mut state);
        }
        evicted
    }

    /// Take idle sessions due for a keep-alive ping out of the idle queues,
    /// counting them as in flight.
    pub(crate) fn take_for_refresh(&self, now: Instant) -> Vec<Session> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }

        let interval = self.config.refresh_interval;
        let mut due = Vec::new();
        for capability in [Capability::ReadOnly, Capability::ReadWrite] {
            let queue = state.idle_queue(capability);
            let mut keep = VecDeque::with_capacity(queue.len());
            for session in queue.drain(..) {
                if now.saturating_duration_since(session.refreshed_at()) >= interval {
                    due.push(session);
                } else {
                    keep.push_back(session);
                }
            }
            *queue = keep;
        }
        state.in_flight += due.len() as u32;
        due
    }

    /// Put a pinged session back, or replace it if the ping failed.
    pub(crate) fn finish_refresh(self: &Arc<Self>, mut session: Session, health: HealthCheckResult) {
        self.metrics.record_health_check(health.is_healthy());
        let mut state = self.state.lock();
        state.in_flight -= 1;

        match health {
            HealthCheckResult::Healthy => {
                session.mark_refreshed(Instant::now());
                self.dispatch(&mut state, session);
            }
            HealthCheckResult::Unhealthy(reason) => {
                tracing::warn!(
                    database = %self.database,
                    session = session.name(),
                    reason = %reason,
                    "idle session failed health check"
                );
                session.mark_invalid();
                self.schedule_delete(session);
                self.serve_waiters(&mut state);
            }
        }
    }

    /// Reserve in-flight slots for the creations needed to restore the warm
    /// minimum, bounded by the concurrent-creation cap.
    pub(crate) fn reserve_top_up(&self) -> Vec<Capability> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }

        let deficit = self.config.min_sessions.saturating_sub(state.total());
        let room = self
            .config
            .max_concurrent_creations
            .saturating_sub(state.in_flight);
        let count = deficit.min(room);
        if count == 0 {
            return Vec::new();
        }

        let read_write_now = state.idle_read_write.len()
            + state
                .leased
                .values()
                .filter(|s| s.capability() == Capability::ReadWrite)
                .count();
        let mut read_write_needed = self
            .config
            .warm_read_write_target()
            .saturating_sub(read_write_now as u32);

        state.in_flight += count;
        (0..count)
            .map(|_| {
                if read_write_needed > 0 {
                    read_write_needed -= 1;
                    Capability::ReadWrite
                } else {
                    Capability::ReadOnly
                }
            })
            .collect()
    }

    /// Close the pool: fail waiters and delete idle and leased sessions.
    pub(crate) async fn shutdown(&self) {
        let (waiters, sessions) = {
            let mut state = self.state.lock();
            state.closed = true;
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            let mut sessions: Vec<Session> = state.idle_read_only.drain(..).collect();
            sessions.extend(state.idle_read_write.drain(..));
            sessions.extend(state.leased.drain().map(|(_, session)| session));
            (waiters, sessions)
        };

        tracing::debug!(
            database = %self.database,
            waiters = waiters.len(),
            sessions = sessions.len(),
            "shutting down database pool"
        );
        for waiter in waiters {
            let _ = waiter.reply.send(Err(PoolError::Shutdown));
        }
        self.delete_sessions(sessions).await;
    }

    /// Delete sessions concurrently and wait for all deletions.
    pub(crate) async fn delete_sessions(&self, sessions: Vec<Session>) {
        let mut deletions = JoinSet::new();
        for session in sessions {
            let factory = Arc::clone(&self.factory);
            let metrics = Arc::clone(&self.metrics);
            deletions.spawn_on(delete_session(factory, metrics, session), &self.runtime);
        }
        while let Some(joined) = deletions.join_next().await {
            if let Err(e) = joined {
                tracing::error!(database = %self.database, error = %e, "session deletion task failed");
            }
        }
    }

    fn schedule_delete(&self, session: Session) {
        let factory = Arc::clone(&self.factory);
        let metrics = Arc::clone(&self.metrics);
        self.runtime.spawn(delete_session(factory, metrics, session));
    }

    /// Read this database's counters.
    pub(crate) fn statistics(&self) -> DatabaseStatistics {
        let state = self.state.lock();
        DatabaseStatistics {
            database_name: self.database.clone(),
            read_pool_count: state.idle_read_only.len() as u32,
            read_write_pool_count: state.idle_read_write.len() as u32,
            active_session_count: state.leased.len() as u32,
            in_flight_creation_count: state.in_flight,
            pending_acquisition_count: state.waiters.len() as u32,
            max_sessions: self.config.max_sessions,
        }
    }
}

/// Best-effort deletion; the backing store expires sessions it never hears
/// about again.
async fn delete_session(factory: DynSessionFactory, metrics: Arc<MetricsRecorder>, session: Session) {
    match factory.delete_session(&session).await {
        Ok(()) => {
            metrics.record_deleted();
            tracing::debug!(session = session.name(), "session deleted");
        }
        Err(e) => {
            tracing::warn!(session = session.name(), error = %e, "failed to delete session");
        }
    }
}

/// An acquisition waiting for a handoff or an earmarked creation.
///
/// Dropping it before completion (deadline or cancellation) removes the
/// queued waiter and returns any session that was handed over meanwhile.
struct PendingAcquire {
    pool: Arc<DatabasePool>,
    waiter_id: Option<u64>,
    rx: oneshot::Receiver<Result<Session, PoolError>>,
    completed: bool,
}

impl PendingAcquire {
    async fn wait(mut self, deadline: Instant, started: Instant) -> Result<Session, PoolError> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => {
                self.completed = true;
                result
            }
            // The sender is only dropped without a reply when the pool goes away.
            Ok(Err(_)) => {
                self.completed = true;
                Err(PoolError::Shutdown)
            }
            Err(_elapsed) => {
                tracing::debug!(
                    database = %self.pool.database,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "session acquisition deadline exceeded"
                );
                Err(PoolError::DeadlineExceeded {
                    database: self.pool.database.clone(),
                    waited: started.elapsed(),
                })
            }
        }
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(id) = self.waiter_id {
            self.pool.remove_waiter(id);
        }
        self.rx.close();
        if let Ok(Ok(session)) = self.rx.try_recv() {
            tracing::trace!(session = session.name(), "returning session handed to a departed waiter");
            self.pool.reclaim(session);
        }
    }
}
