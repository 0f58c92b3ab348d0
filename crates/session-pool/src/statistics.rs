//! Point-in-time statistics snapshots.
//!
//! The serialized field names are a stable observability contract
//! (`TotalReadPoolCount`, `ReadPoolCount`, ...); renaming a Rust field
//! must keep its `serde` name.

use serde::Serialize;

use crate::session::DatabaseName;

/// Counters of one database pool at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseStatistics {
    /// The database these counters belong to.
    pub database_name: DatabaseName,
    /// Idle read-only sessions.
    pub read_pool_count: u32,
    /// Idle read/write sessions.
    pub read_write_pool_count: u32,
    /// Sessions currently leased to callers.
    pub active_session_count: u32,
    /// Creations, refresh pings and transaction begins in flight.
    pub in_flight_creation_count: u32,
    /// Callers queued for a session.
    pub pending_acquisition_count: u32,
    /// Configured maximum for this database.
    #[serde(skip)]
    pub max_sessions: u32,
}

impl DatabaseStatistics {
    /// Idle + active + in-flight sessions.
    #[must_use]
    pub fn total_sessions(&self) -> u32 {
        self.read_pool_count
            + self.read_write_pool_count
            + self.active_session_count
            + self.in_flight_creation_count
    }

    /// Calculate the utilization percentage (active over maximum).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_sessions == 0 {
            return 0.0;
        }
        (f64::from(self.active_session_count) / f64::from(self.max_sessions)) * 100.0
    }

    /// Check if the database pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total_sessions() >= self.max_sessions
    }
}

/// A snapshot of statistics for a [`SessionPool`](crate::SessionPool).
///
/// Totals are summed once at construction; each database's counters were
/// read under that database's lock, but different databases may have been
/// read at slightly different instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statistics {
    total_read_pool_count: u32,
    total_read_write_pool_count: u32,
    total_active_session_count: u32,
    total_in_flight_creation_count: u32,
    total_pending_acquisition_count: u32,
    per_database_statistics: Vec<DatabaseStatistics>,
}

impl Statistics {
    /// Aggregate per-database counters into pool-wide totals.
    #[must_use]
    pub fn new(mut per_database_statistics: Vec<DatabaseStatistics>) -> Self {
        per_database_statistics.sort_by(|a, b| a.database_name.cmp(&b.database_name));
        let sum = |field: fn(&DatabaseStatistics) -> u32| {
            per_database_statistics.iter().map(field).sum::<u32>()
        };

        Self {
            total_read_pool_count: sum(|d| d.read_pool_count),
            total_read_write_pool_count: sum(|d| d.read_write_pool_count),
            total_active_session_count: sum(|d| d.active_session_count),
            total_in_flight_creation_count: sum(|d| d.in_flight_creation_count),
            total_pending_acquisition_count: sum(|d| d.pending_acquisition_count),
            per_database_statistics,
        }
    }

    /// The total number of idle read-only sessions in the pool.
    #[must_use]
    pub fn total_read_pool_count(&self) -> u32 {
        self.total_read_pool_count
    }

    /// The total number of idle read/write sessions in the pool.
    #[must_use]
    pub fn total_read_write_pool_count(&self) -> u32 {
        self.total_read_write_pool_count
    }

    /// The total number of active sessions.
    #[must_use]
    pub fn total_active_session_count(&self) -> u32 {
        self.total_active_session_count
    }

    /// The total number of session creation (or refresh, or transaction
    /// creation) requests in flight.
    #[must_use]
    pub fn total_in_flight_creation_count(&self) -> u32 {
        self.total_in_flight_creation_count
    }

    /// The total number of client calls awaiting sessions.
    #[must_use]
    pub fn total_pending_acquisition_count(&self) -> u32 {
        self.total_pending_acquisition_count
    }

    /// The statistics broken down by database, ordered by database name.
    #[must_use]
    pub fn per_database_statistics(&self) -> &[DatabaseStatistics] {
        &self.per_database_statistics
    }

    /// The statistics of one database, if the pool knows it.
    #[must_use]
    pub fn database(&self, name: &DatabaseName) -> Option<&DatabaseStatistics> {
        self.per_database_statistics
            .iter()
            .find(|d| &d.database_name == name)
    }
}
