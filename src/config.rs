//! Engine configuration
//!
//! A `CacheConfig` is built once at startup and handed to `QuantDb::open`;
//! nothing in the crate reads ambient global state after construction.
//! Recognized environment variables: `QDB_CACHE_DIR`, `QDB_LOG_LEVEL`,
//! `QDB_CACHE_TTL` (seconds, uniform override of every TTL kind).

use std::path::PathBuf;
use std::time::Duration;

/// Directory name used under the home directory when nothing is configured.
const DEFAULT_CACHE_DIR_NAME: &str = ".quantdb_cache";

/// Configuration for a cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the bar database and the calendar snapshot.
    pub cache_dir: PathBuf,
    /// Bound on concurrent upstream calls.
    pub max_concurrent_upstream: usize,
    /// Bound on callers queued behind the upstream permits; overflow is
    /// rejected with `Overloaded` before any upstream work starts.
    pub upstream_queue_limit: usize,
    /// Per-request deadline enforced at the engine edge.
    pub request_deadline: Option<Duration>,
    /// Retry bounds for retryable upstream failures.
    pub retry: RetryConfig,
    /// Treat weekdays as trading days when no calendar snapshot can be
    /// obtained, instead of failing with `CalendarUnavailable`.
    pub allow_calendar_fallback: bool,
    /// Uniform TTL override applied to every cache kind, `QDB_CACHE_TTL`.
    pub ttl_override: Option<Duration>,
    /// Minimum interval between refetches of a hot run during market hours.
    pub hot_guard_open: Duration,
    /// Minimum interval between refetches of a hot run off hours.
    pub hot_guard_closed: Duration,
    /// How long "upstream has no data for this day" is remembered for
    /// historical dates.
    pub negative_ttl: Duration,
    /// Negative-coverage memory for the current market date.
    pub negative_ttl_today: Duration,
    /// Descriptive asset fields older than this are refreshed on access.
    pub asset_info_max_age: Duration,
}

/// Bounds for the shared upstream retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            cap: Duration::from_secs(2),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_concurrent_upstream: 8,
            upstream_queue_limit: 32,
            request_deadline: None,
            retry: RetryConfig::default(),
            allow_calendar_fallback: false,
            ttl_override: None,
            hot_guard_open: Duration::from_secs(60),
            hot_guard_closed: Duration::from_secs(30 * 60),
            negative_ttl: Duration::from_secs(7 * 24 * 3600),
            negative_ttl_today: Duration::from_secs(3600),
            asset_info_max_age: Duration::from_secs(24 * 3600),
        }
    }
}

impl CacheConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("QDB_CACHE_DIR") {
            if !dir.is_empty() {
                cfg.cache_dir = PathBuf::from(dir);
            }
        }
        if let Ok(secs) = std::env::var("QDB_CACHE_TTL") {
            if let Ok(secs) = secs.parse::<u64>() {
                cfg.ttl_override = Some(Duration::from_secs(secs));
            } else {
                log::warn!("ignoring unparseable QDB_CACHE_TTL={secs:?}");
            }
        }
        cfg
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Path of the embedded bar database file.
    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("quantdb.sqlite")
    }

    /// Path of the calendar snapshot file.
    pub fn calendar_path(&self) -> PathBuf {
        self.cache_dir.join("calendar_snapshot.json")
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_CACHE_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let cfg = CacheConfig::default().with_cache_dir("/tmp/qdb-test");
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/qdb-test/quantdb.sqlite"));
        assert_eq!(
            cfg.calendar_path(),
            PathBuf::from("/tmp/qdb-test/calendar_snapshot.json")
        );
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(250));
        assert_eq!(retry.cap, Duration::from_secs(2));
    }
}
