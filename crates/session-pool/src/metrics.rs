//! Cumulative pool metrics.
//!
//! Unlike [`Statistics`](crate::Statistics), which describes the pool at one
//! instant, metrics count events since the pool was created.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters shared by every database pool.
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    created_at: Instant,
    sessions_created: AtomicU64,
    sessions_deleted: AtomicU64,
    creations_failed: AtomicU64,
    checkouts_successful: AtomicU64,
    checkouts_failed: AtomicU64,
    health_checks_performed: AtomicU64,
    health_checks_failed: AtomicU64,
    sessions_evicted: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn new() -> Self {
        Self {
            created_at: Instant::now(),
            sessions_created: AtomicU64::new(0),
            sessions_deleted: AtomicU64::new(0),
            creations_failed: AtomicU64::new(0),
            checkouts_successful: AtomicU64::new(0),
            checkouts_failed: AtomicU64::new(0),
            health_checks_performed: AtomicU64::new(0),
            health_checks_failed: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self) {
        self.sessions_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_creation_failed(&self) {
        self.creations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkout(&self, success: bool) {
        let counter = if success {
            &self.checkouts_successful
        } else {
            &self.checkouts_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_health_check(&self, healthy: bool) {
        self.health_checks_performed.fetch_add(1, Ordering::Relaxed);
        if !healthy {
            self.health_checks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_evicted(&self, count: u64) {
        self.sessions_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_deleted: self.sessions_deleted.load(Ordering::Relaxed),
            creations_failed: self.creations_failed.load(Ordering::Relaxed),
            checkouts_successful: self.checkouts_successful.load(Ordering::Relaxed),
            checkouts_failed: self.checkouts_failed.load(Ordering::Relaxed),
            health_checks_performed: self.health_checks_performed.load(Ordering::Relaxed),
            health_checks_failed: self.health_checks_failed.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed(),
        }
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Sessions created since pool start.
    pub sessions_created: u64,
    /// Sessions deleted since pool start (eviction, invalidation, shutdown).
    pub sessions_deleted: u64,
    /// Create or begin-transaction calls that failed.
    pub creations_failed: u64,
    /// Successful session checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (deadline, shutdown, creation failure).
    pub checkouts_failed: u64,
    /// Pings performed on idle sessions.
    pub health_checks_performed: u64,
    /// Pings that found the session dead.
    pub health_checks_failed: u64,
    /// Idle sessions evicted by maintenance.
    pub sessions_evicted: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate health check success rate (0.0 to 1.0).
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        if self.health_checks_performed == 0 {
            return 1.0;
        }
        let successful = self.health_checks_performed - self.health_checks_failed;
        successful as f64 / self.health_checks_performed as f64
    }
}
