//! Pool configuration.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::PoolError;

/// Stand-in for "never" when a configured delay does not fit in an
/// [`Instant`]: roughly thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, saturating at a far-future instant instead of overflowing.
pub(crate) fn instant_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Configuration of one database's session pool.
///
/// A [`SessionPool`](crate::SessionPool) applies the default configuration
/// to every database, unless an override was registered for it through
/// [`SessionPoolBuilder::database_config`](crate::SessionPoolBuilder::database_config).
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Number of sessions kept warm by maintenance.
    pub min_sessions: u32,

    /// Upper bound on idle + active + in-flight sessions.
    pub max_sessions: u32,

    /// Idle sessions unused for longer than this are evicted, down to
    /// `min_sessions`.
    pub idle_timeout: Duration,

    /// Idle sessions neither used nor pinged for longer than this are pinged
    /// to keep them alive upstream.
    pub refresh_interval: Duration,

    /// Period of the background maintenance loop.
    pub maintenance_interval: Duration,

    /// Cap on creations dispatched concurrently by top-up.
    pub max_concurrent_creations: u32,

    /// Share of the warm minimum created as read/write sessions.
    pub write_sessions_fraction: f64,

    /// Deadline used by [`SessionPool::acquire`](crate::SessionPool::acquire).
    pub acquire_timeout: Duration,

    /// Allow a read-only request to lease an idle read/write session.
    pub reuse_read_write_for_read_only: bool,

    /// Upper bound of the top-up backoff after failed creations.
    pub top_up_backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 100,
            idle_timeout: Duration::from_secs(600),
            refresh_interval: Duration::from_secs(900),
            maintenance_interval: Duration::from_secs(30),
            max_concurrent_creations: 10,
            write_sessions_fraction: 0.2,
            acquire_timeout: Duration::from_secs(30),
            reuse_read_write_for_read_only: false,
            top_up_backoff_max: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a settings string into configuration.
    ///
    /// Accepts `Key=Value;` pairs, keys are case-insensitive and durations
    /// are given in seconds:
    ///
    /// ```text
    /// MinSessions=2;MaxSessions=50;IdleTimeout=300;WriteSessionsFraction=0.5;
    /// ```
    pub fn from_settings_string(settings: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();

        for part in settings.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "minsessions" | "min sessions" => config.min_sessions = parse_count(value)?,
                "maxsessions" | "max sessions" => config.max_sessions = parse_count(value)?,
                "idletimeout" | "idle timeout" => config.idle_timeout = parse_seconds(value)?,
                "refreshinterval" | "refresh interval" => {
                    config.refresh_interval = parse_seconds(value)?;
                }
                "maintenanceinterval" | "maintenance interval" => {
                    config.maintenance_interval = parse_seconds(value)?;
                }
                "maxconcurrentcreations" | "max concurrent creations" => {
                    config.max_concurrent_creations = parse_count(value)?;
                }
                "writesessionsfraction" | "write sessions fraction" => {
                    config.write_sessions_fraction = value.parse().map_err(|_| {
                        PoolError::Config(format!("invalid fraction: {value}"))
                    })?;
                }
                "acquiretimeout" | "acquire timeout" => {
                    config.acquire_timeout = parse_seconds(value)?;
                }
                "topupbackoffmax" | "top up backoff max" => {
                    config.top_up_backoff_max = parse_seconds(value)?;
                }
                "reusereadwriteforreadonly" | "reuse read write for read only" => {
                    config.reuse_read_write_for_read_only = value.eq_ignore_ascii_case("true")
                        || value.eq_ignore_ascii_case("yes")
                        || value == "1";
                }
                _ => {
                    // Ignore unknown options for forward compatibility
                    tracing::debug!(key = key, value = value, "ignoring unknown pool setting");
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_sessions == 0 {
            return Err(PoolError::Config("max_sessions must be at least 1".into()));
        }
        if self.min_sessions > self.max_sessions {
            return Err(PoolError::Config(format!(
                "min_sessions ({}) exceeds max_sessions ({})",
                self.min_sessions, self.max_sessions
            )));
        }
        if self.max_concurrent_creations == 0 {
            return Err(PoolError::Config(
                "max_concurrent_creations must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.write_sessions_fraction) {
            return Err(PoolError::Config(format!(
                "write_sessions_fraction must be within [0, 1], got {}",
                self.write_sessions_fraction
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(PoolError::Config(
                "maintenance_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Number of warm sessions maintenance creates as read/write.
    #[must_use]
    pub fn warm_read_write_target(&self) -> u32 {
        (f64::from(self.min_sessions) * self.write_sessions_fraction).round() as u32
    }

    /// Set the minimum number of warm sessions.
    #[must_use]
    pub fn min_sessions(mut self, count: u32) -> Self {
        self.min_sessions = count;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_sessions(mut self, count: u32) -> Self {
        self.max_sessions = count;
        self
    }

    /// Set the idle eviction timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the keep-alive refresh interval.
    #[must_use]
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the maintenance loop period.
    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the cap on concurrent top-up creations.
    #[must_use]
    pub fn max_concurrent_creations(mut self, count: u32) -> Self {
        self.max_concurrent_creations = count;
        self
    }

    /// Set the share of warm sessions created as read/write.
    #[must_use]
    pub fn write_sessions_fraction(mut self, fraction: f64) -> Self {
        self.write_sessions_fraction = fraction;
        self
    }

    /// Set the default acquisition deadline.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Allow read-only requests to lease idle read/write sessions.
    #[must_use]
    pub fn reuse_read_write_for_read_only(mut self, enabled: bool) -> Self {
        self.reuse_read_write_for_read_only = enabled;
        self
    }

    /// Set the upper bound of the top-up backoff.
    #[must_use]
    pub fn top_up_backoff_max(mut self, max: Duration) -> Self {
        self.top_up_backoff_max = max;
        self
    }
}

fn parse_count(value: &str) -> Result<u32, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Config(format!("invalid count: {value}")))
}

fn parse_seconds(value: &str) -> Result<Duration, PoolError> {
    let secs: u64 = value
        .parse()
        .map_err(|_| PoolError::Config(format!("invalid duration: {value}")))?;
    Ok(Duration::from_secs(secs))
}
