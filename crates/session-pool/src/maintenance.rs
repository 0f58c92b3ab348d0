//! Background maintenance of database pools.
//!
//! Each cycle evicts long-idle sessions (down to the warm minimum), pings
//! sessions that have not been refreshed for `refresh_interval`, and tops up
//! towards `min_sessions`. Leased sessions are never touched.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::instant_after;
use crate::database::DatabasePool;
use crate::error::FactoryError;

/// Exponential backoff of top-up after failed creations.
#[derive(Debug, Default)]
pub(crate) struct TopUpBackoff {
    failures: u32,
    until: Option<Instant>,
}

impl TopUpBackoff {
    pub(crate) fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// Record a failed top-up. Retryable failures double the delay from
    /// `base`; anything else waits the full `max`.
    pub(crate) fn record_failure(
        &mut self,
        now: Instant,
        base: Duration,
        max: Duration,
        retryable: bool,
    ) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = if retryable {
            base.saturating_mul(2u32.saturating_pow(self.failures - 1))
                .min(max)
        } else {
            max
        };
        self.until = Some(instant_after(now, delay));
        delay
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Spawn the periodic maintenance loop of one database pool.
///
/// The first cycle runs one interval after spawning; use
/// [`run_cycle`] to warm a pool immediately.
pub(crate) fn spawn(pool: Arc<DatabasePool>, shutdown: CancellationToken) -> JoinHandle<()> {
    let period = pool.config().maintenance_interval;
    let runtime = pool.runtime().clone();
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(instant_after(Instant::now(), period), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // Top-up failures are logged and backed off inside.
                    let _ = run_cycle(&pool).await;
                }
            }
        }
        tracing::debug!(database = %pool.database(), "maintenance loop stopped");
    })
}

/// Run one maintenance cycle to completion.
///
/// Returns the first top-up creation failure, if any.
pub(crate) async fn run_cycle(pool: &Arc<DatabasePool>) -> Result<(), FactoryError> {
    let now = Instant::now();
    evict(pool, now).await;
    refresh(pool, now).await;
    top_up(pool, now).await
}

async fn evict(pool: &Arc<DatabasePool>, now: Instant) {
    let evicted = pool.evict_idle(now);
    if evicted.is_empty() {
        return;
    }
    tracing::debug!(
        database = %pool.database(),
        count = evicted.len(),
        "evicting idle sessions"
    );
    pool.metrics().record_evicted(evicted.len() as u64);
    pool.delete_sessions(evicted).await;
}

async fn refresh(pool: &Arc<DatabasePool>, now: Instant) {
    let due = pool.take_for_refresh(now);
    if due.is_empty() {
        return;
    }
    tracing::debug!(
        database = %pool.database(),
        count = due.len(),
        "refreshing idle sessions"
    );

    let mut pings = JoinSet::new();
    for session in due {
        let owner = Arc::clone(pool);
        pings.spawn_on(
            async move {
                let health = owner.factory().ping_session(&session).await;
                owner.finish_refresh(session, health);
            },
            pool.runtime(),
        );
    }
    while let Some(joined) = pings.join_next().await {
        if let Err(e) = joined {
            tracing::error!(database = %pool.database(), error = %e, "session ping task failed");
        }
    }
}

async fn top_up(pool: &Arc<DatabasePool>, now: Instant) -> Result<(), FactoryError> {
    if pool.backoff().lock().is_active(now) {
        tracing::trace!(database = %pool.database(), "top-up backing off");
        return Ok(());
    }

    let capabilities = pool.reserve_top_up();
    if capabilities.is_empty() {
        return Ok(());
    }
    tracing::debug!(
        database = %pool.database(),
        count = capabilities.len(),
        "topping up session pool"
    );

    let mut creations = JoinSet::new();
    for capability in capabilities {
        creations.spawn_on(
            Arc::clone(pool).create_and_dispatch(capability, None),
            pool.runtime(),
        );
    }

    let mut first_error = None;
    while let Some(joined) = creations.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                tracing::error!(database = %pool.database(), error = %e, "session creation task failed");
            }
        }
    }

    let config = pool.config();
    let mut backoff = pool.backoff().lock();
    match first_error {
        None => {
            backoff.reset();
            Ok(())
        }
        Some(error) => {
            let delay = backoff.record_failure(
                Instant::now(),
                config.maintenance_interval,
                config.top_up_backoff_max,
                error.is_retryable(),
            );
            if error.is_retryable() {
                tracing::warn!(
                    database = %pool.database(),
                    error = %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "session top-up failed, backing off"
                );
            } else {
                tracing::error!(
                    database = %pool.database(),
                    error = %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "session top-up failed with a non-retryable error"
                );
            }
            Err(error)
        }
    }
}
