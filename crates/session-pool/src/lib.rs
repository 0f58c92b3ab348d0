//! # session-pool
//!
//! Pool of remotely provisioned database sessions for transactional clients.
//!
//! Creating a session costs a network round trip and server-side resources,
//! sessions expire when left alone, and each database only grants a limited
//! number of them. This crate keeps a warm supply per database, leases
//! sessions to concurrent callers with low latency and reports live
//! utilization.
//!
//! ## Features
//!
//! - One independent pool per database, created on first use
//! - Read-only and read/write sessions kept in separate idle queues
//! - LIFO reuse so surplus sessions age out and get evicted
//! - FIFO queue of waiting callers with direct handoff on release
//! - Deadlines and cancellation that never leak a session
//! - Background eviction, keep-alive pings and top-up to a warm minimum
//! - Point-in-time statistics and cumulative metrics
//!
//! The network operations themselves are supplied by the caller through
//! the [`SessionFactory`] trait.
//!
//! ## Example
//!
//! ```rust,ignore
//! use session_pool::{Capability, DatabaseName, PoolConfig, SessionPool};
//! use std::time::Duration;
//!
//! let pool = SessionPool::builder(factory)
//!     .min_sessions(5)
//!     .max_sessions(100)
//!     .idle_timeout(Duration::from_secs(600))
//!     .build()
//!     .await?;
//!
//! let db = DatabaseName::new("projects/p/instances/i/databases/d");
//! pool.when_ready(&db).await?;
//!
//! let session = pool.acquire(&db, Capability::ReadOnly).await?;
//! // Use session...
//! // Session automatically returned to the pool on drop
//!
//! let stats = pool.statistics();
//! println!("active sessions: {}", stats.total_active_session_count());
//!
//! pool.shutdown().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod statistics;

mod database;
mod maintenance;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::{FactoryError, FactoryErrorKind, PoolError};

// Pool types
pub use metrics::PoolMetrics;
pub use pool::{PooledSession, SessionPool, SessionPoolBuilder};
pub use statistics::{DatabaseStatistics, Statistics};

// Sessions and their lifecycle
pub use lifecycle::{DynSessionFactory, HealthCheckResult, SessionFactory};
pub use session::{Capability, DatabaseName, Session, SessionKind, SessionState, TransactionId};
