//! Configuration from environment variables (and `.env` via dotenv in the
//! binaries)
//!
//! Every loader has a `from_lookup` variant taking a key -> value function so
//! tests never touch the process environment.

use crate::types::SECONDS_PER_DAY;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TWITCH_API_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_TWITCH_AUTH_URL: &str = "https://id.twitch.tv";
pub const DEFAULT_YOUTUBE_API_URL: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get<L>(lookup: &L, key: &'static str) -> Option<String>
where
    L: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<L, T>(lookup: &L, key: &'static str, default: T) -> Result<T, ConfigError>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(lookup, key) {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// A gap spanning more than a day would need recomputing days beyond the
/// neighbours of a new snapshot
fn at_most_one_day(key: &'static str, secs: i64) -> Result<i64, ConfigError> {
    if secs <= SECONDS_PER_DAY {
        Ok(secs)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
            reason: format!("must be at most {} (one day)", SECONDS_PER_DAY),
        })
    }
}

fn positive<T: PartialOrd + Default + ToString>(key: &'static str, value: T) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        })
    }
}

/// Where the two databases live and how long a store call may take
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub staging_db_path: String,
    pub durable_db_path: String,
    pub store_timeout: Duration,
}

impl StoreConfig {
    /// Environment variables:
    /// - `STAGING_DB_PATH` (default: data/staging.db)
    /// - `DURABLE_DB_PATH` (default: data/durable.db)
    /// - `STORE_TIMEOUT_SECS` (default: 5)
    pub fn from_lookup<L: Fn(&str) -> Option<String>>(lookup: &L) -> Result<Self, ConfigError> {
        Ok(Self {
            staging_db_path: get(lookup, "STAGING_DB_PATH")
                .unwrap_or_else(|| "data/staging.db".to_string()),
            durable_db_path: get(lookup, "DURABLE_DB_PATH")
                .unwrap_or_else(|| "data/durable.db".to_string()),
            store_timeout: Duration::from_secs(positive(
                "STORE_TIMEOUT_SECS",
                parse_or(lookup, "STORE_TIMEOUT_SECS", 5u64)?,
            )?),
        })
    }
}

/// Exponential backoff parameters shared by every collector
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Attempts per tick for the adapter call and for the staging append
    pub max_sync_retries: u32,
}

impl RetryConfig {
    pub fn from_lookup<L: Fn(&str) -> Option<String>>(lookup: &L) -> Result<Self, ConfigError> {
        let initial_ms = positive(
            "BACKOFF_INITIAL_MS",
            parse_or(lookup, "BACKOFF_INITIAL_MS", 1_000u64)?,
        )?;
        let max_secs = positive(
            "BACKOFF_MAX_SECS",
            parse_or(lookup, "BACKOFF_MAX_SECS", 300u64)?,
        )?;
        Ok(Self {
            backoff_initial: Duration::from_millis(initial_ms),
            backoff_max: Duration::from_secs(max_secs),
            max_sync_retries: parse_or(lookup, "MAX_SYNC_RETRIES", 3u32)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_url: String,
    pub auth_url: String,
    pub max_pages: u32,
    /// Streams below this many viewers are not recorded
    pub min_viewers: u64,
    pub http_timeout: Duration,
}

impl TwitchConfig {
    /// `None` when no Twitch credentials are configured
    fn from_lookup<L: Fn(&str) -> Option<String>>(
        lookup: &L,
        http_timeout: Duration,
    ) -> Result<Option<Self>, ConfigError> {
        let client_id = get(lookup, "TWITCH_CLIENT_ID");
        let client_secret = get(lookup, "TWITCH_CLIENT_SECRET");
        let (client_id, client_secret) = match (client_id, client_secret) {
            (None, None) => return Ok(None),
            (Some(_), None) => return Err(ConfigError::Missing { key: "TWITCH_CLIENT_SECRET" }),
            (None, Some(_)) => return Err(ConfigError::Missing { key: "TWITCH_CLIENT_ID" }),
            (Some(id), Some(secret)) => (id, secret),
        };

        Ok(Some(Self {
            client_id,
            client_secret,
            api_url: get(lookup, "TWITCH_API_URL").unwrap_or_else(|| DEFAULT_TWITCH_API_URL.to_string()),
            auth_url: get(lookup, "TWITCH_AUTH_URL").unwrap_or_else(|| DEFAULT_TWITCH_AUTH_URL.to_string()),
            max_pages: positive("TWITCH_MAX_PAGES", parse_or(lookup, "TWITCH_MAX_PAGES", 10u32)?)?,
            min_viewers: parse_or(lookup, "TWITCH_MIN_VIEWERS", 10u64)?,
            http_timeout,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct YouTubeConfig {
    pub api_key: String,
    pub api_url: String,
    /// Upper bound on live videos fetched per poll
    pub max_results: u32,
    /// Wait applied when the daily quota is exhausted
    pub quota_backoff: Duration,
    pub http_timeout: Duration,
}

impl YouTubeConfig {
    fn from_lookup<L: Fn(&str) -> Option<String>>(
        lookup: &L,
        http_timeout: Duration,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(api_key) = get(lookup, "YOUTUBE_API_KEY") else {
            return Ok(None);
        };
        Ok(Some(Self {
            api_key,
            api_url: get(lookup, "YOUTUBE_API_URL").unwrap_or_else(|| DEFAULT_YOUTUBE_API_URL.to_string()),
            max_results: positive(
                "YOUTUBE_MAX_RESULTS",
                parse_or(lookup, "YOUTUBE_MAX_RESULTS", 100u32)?,
            )?,
            quota_backoff: Duration::from_secs(parse_or(lookup, "YOUTUBE_QUOTA_BACKOFF_SECS", 3_600u64)?),
            http_timeout,
        }))
    }
}

/// Configuration for the `collector` binary
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub identity_path: Option<String>,
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub twitch: Option<TwitchConfig>,
    pub youtube: Option<YouTubeConfig>,
}

impl CollectorConfig {
    /// Environment variables:
    /// - `POLL_INTERVAL_SECS` (default: 60)
    /// - `HTTP_TIMEOUT_SECS` (default: 10)
    /// - `IDENTITY_PATH` (default: built-in identity map)
    /// - `TWITCH_CLIENT_ID` / `TWITCH_CLIENT_SECRET` (Twitch disabled if unset)
    /// - `TWITCH_API_URL`, `TWITCH_AUTH_URL`, `TWITCH_MAX_PAGES` (10), `TWITCH_MIN_VIEWERS` (10)
    /// - `YOUTUBE_API_KEY` (YouTube disabled if unset)
    /// - `YOUTUBE_API_URL`, `YOUTUBE_MAX_RESULTS` (100), `YOUTUBE_QUOTA_BACKOFF_SECS` (3600)
    /// - plus the `StoreConfig` and `RetryConfig` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup<L: Fn(&str) -> Option<String>>(lookup: &L) -> Result<Self, ConfigError> {
        let poll_secs = positive("POLL_INTERVAL_SECS", parse_or(lookup, "POLL_INTERVAL_SECS", 60u64)?)?;
        let http_timeout = Duration::from_secs(positive(
            "HTTP_TIMEOUT_SECS",
            parse_or(lookup, "HTTP_TIMEOUT_SECS", 10u64)?,
        )?);

        Ok(Self {
            poll_interval: Duration::from_secs(poll_secs),
            http_timeout,
            identity_path: get(lookup, "IDENTITY_PATH"),
            store: StoreConfig::from_lookup(lookup)?,
            retry: RetryConfig::from_lookup(lookup)?,
            twitch: TwitchConfig::from_lookup(lookup, http_timeout)?,
            youtube: YouTubeConfig::from_lookup(lookup, http_timeout)?,
        })
    }

    pub fn log_summary(&self) {
        log::info!("📋 Collector configuration:");
        log::info!("   ├─ Poll interval: {}s", self.poll_interval.as_secs());
        log::info!("   ├─ HTTP timeout: {}s", self.http_timeout.as_secs());
        log::info!("   ├─ Staging DB: {}", self.store.staging_db_path);
        log::info!(
            "   ├─ Backoff: {}ms initial, {}s cap, {} attempts",
            self.retry.backoff_initial.as_millis(),
            self.retry.backoff_max.as_secs(),
            self.retry.max_sync_retries
        );
        log::info!(
            "   ├─ Identity map: {}",
            self.identity_path.as_deref().unwrap_or("built-in")
        );
        log::info!(
            "   ├─ Twitch: {}",
            match &self.twitch {
                Some(t) => format!("{} (max {} pages, min {} viewers)", t.api_url, t.max_pages, t.min_viewers),
                None => "disabled".to_string(),
            }
        );
        log::info!(
            "   └─ YouTube: {}",
            match &self.youtube {
                Some(y) => format!("{} (top {} live videos)", y.api_url, y.max_results),
                None => "disabled".to_string(),
            }
        );
    }
}

/// Configuration for the `aggregator` and `health` binaries
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub store: StoreConfig,
    pub identity_path: Option<String>,
    pub aggregation_interval: Duration,
    /// Roll-up lengths in days, ascending, without 1
    pub window_lengths: Vec<u32>,
    /// Consecutive snapshots further apart than this are a gap (zero viewers)
    pub max_gap_secs: i64,
    pub retention_secs: i64,
    pub lease_ttl_secs: i64,
    pub stale_after_secs: i64,
}

impl AggregatorConfig {
    /// Environment variables:
    /// - `AGGREGATION_INTERVAL_SECS` (default: 3600)
    /// - `WINDOW_LENGTHS_DAYS` (default: 3,7,30,90)
    /// - `MAX_GAP_SECS` (default: 3 x `POLL_INTERVAL_SECS`, at most one day)
    /// - `RETENTION_HOURS` (default: 48)
    /// - `LEASE_TTL_SECS` (default: 900)
    /// - `STALE_AFTER_SECS` (default: 5 x `POLL_INTERVAL_SECS`)
    /// - plus the `StoreConfig` variables and `IDENTITY_PATH`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup<L: Fn(&str) -> Option<String>>(lookup: &L) -> Result<Self, ConfigError> {
        let poll_secs = positive("POLL_INTERVAL_SECS", parse_or(lookup, "POLL_INTERVAL_SECS", 60i64)?)?;
        let retention_hours = positive("RETENTION_HOURS", parse_or(lookup, "RETENTION_HOURS", 48i64)?)?;

        Ok(Self {
            store: StoreConfig::from_lookup(lookup)?,
            identity_path: get(lookup, "IDENTITY_PATH"),
            aggregation_interval: Duration::from_secs(positive(
                "AGGREGATION_INTERVAL_SECS",
                parse_or(lookup, "AGGREGATION_INTERVAL_SECS", 3_600u64)?,
            )?),
            window_lengths: parse_window_lengths(
                &get(lookup, "WINDOW_LENGTHS_DAYS").unwrap_or_else(|| "3,7,30,90".to_string()),
            )?,
            max_gap_secs: at_most_one_day(
                "MAX_GAP_SECS",
                positive("MAX_GAP_SECS", parse_or(lookup, "MAX_GAP_SECS", 3 * poll_secs)?)?,
            )?,
            retention_secs: retention_hours * 3_600,
            lease_ttl_secs: positive("LEASE_TTL_SECS", parse_or(lookup, "LEASE_TTL_SECS", 900i64)?)?,
            stale_after_secs: positive(
                "STALE_AFTER_SECS",
                parse_or(lookup, "STALE_AFTER_SECS", 5 * poll_secs)?,
            )?,
        })
    }

    pub fn log_summary(&self) {
        log::info!("📋 Aggregator configuration:");
        log::info!("   ├─ Staging DB: {}", self.store.staging_db_path);
        log::info!("   ├─ Durable DB: {}", self.store.durable_db_path);
        log::info!("   ├─ Interval: {}s", self.aggregation_interval.as_secs());
        log::info!("   ├─ Windows: 1d + {:?}d", self.window_lengths);
        log::info!("   ├─ Max gap: {}s", self.max_gap_secs);
        log::info!("   ├─ Retention: {}h", self.retention_secs / 3_600);
        log::info!("   └─ Lease TTL: {}s", self.lease_ttl_secs);
    }
}

/// "3,7,30,90" -> [3, 7, 30, 90]; 1 is the daily base and is dropped
pub fn parse_window_lengths(raw: &str) -> Result<Vec<u32>, ConfigError> {
    let mut lengths = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let days: u32 = part.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            key: "WINDOW_LENGTHS_DAYS",
            value: raw.to_string(),
            reason: e.to_string(),
        })?;
        if days == 0 {
            return Err(ConfigError::Invalid {
                key: "WINDOW_LENGTHS_DAYS",
                value: raw.to_string(),
                reason: "window length must be at least 1 day".to_string(),
            });
        }
        if days > 1 {
            lengths.push(days);
        }
    }
    lengths.sort_unstable();
    lengths.dedup();
    Ok(lengths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_collector_defaults() {
        let config = CollectorConfig::from_lookup(&lookup_from(&[])).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.store.store_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.backoff_initial, Duration::from_millis(1_000));
        assert_eq!(config.retry.backoff_max, Duration::from_secs(300));
        assert_eq!(config.retry.max_sync_retries, 3);
        assert!(config.twitch.is_none());
        assert!(config.youtube.is_none());
    }

    #[test]
    fn test_platform_sections() {
        let config = CollectorConfig::from_lookup(&lookup_from(&[
            ("TWITCH_CLIENT_ID", "abc"),
            ("TWITCH_CLIENT_SECRET", "shh"),
            ("TWITCH_MIN_VIEWERS", "25"),
            ("YOUTUBE_API_KEY", "key"),
            ("YOUTUBE_MAX_RESULTS", "50"),
        ]))
        .unwrap();

        let twitch = config.twitch.unwrap();
        assert_eq!(twitch.client_id, "abc");
        assert_eq!(twitch.min_viewers, 25);
        assert_eq!(twitch.max_pages, 10);
        assert_eq!(twitch.api_url, DEFAULT_TWITCH_API_URL);

        let youtube = config.youtube.unwrap();
        assert_eq!(youtube.max_results, 50);
        assert_eq!(youtube.quota_backoff, Duration::from_secs(3_600));
    }

    #[test]
    fn test_half_configured_twitch_is_an_error() {
        let err = CollectorConfig::from_lookup(&lookup_from(&[("TWITCH_CLIENT_ID", "abc")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing { key: "TWITCH_CLIENT_SECRET" });
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = CollectorConfig::from_lookup(&lookup_from(&[("POLL_INTERVAL_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "POLL_INTERVAL_SECS", .. }));

        let err = CollectorConfig::from_lookup(&lookup_from(&[("POLL_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "POLL_INTERVAL_SECS", .. }));
    }

    #[test]
    fn test_aggregator_defaults_follow_poll_interval() {
        let config = AggregatorConfig::from_lookup(&lookup_from(&[("POLL_INTERVAL_SECS", "30")])).unwrap();
        assert_eq!(config.window_lengths, vec![3, 7, 30, 90]);
        assert_eq!(config.max_gap_secs, 90);
        assert_eq!(config.stale_after_secs, 150);
        assert_eq!(config.retention_secs, 48 * 3_600);
        assert_eq!(config.lease_ttl_secs, 900);
        assert_eq!(config.aggregation_interval, Duration::from_secs(3_600));
    }

    #[test]
    fn test_max_gap_longer_than_a_day_is_rejected() {
        let config = AggregatorConfig::from_lookup(&lookup_from(&[("MAX_GAP_SECS", "86400")])).unwrap();
        assert_eq!(config.max_gap_secs, SECONDS_PER_DAY);

        let err = AggregatorConfig::from_lookup(&lookup_from(&[("MAX_GAP_SECS", "86401")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_GAP_SECS", .. }));

        // A long poll interval cannot push the default past a day either
        let err = AggregatorConfig::from_lookup(&lookup_from(&[("POLL_INTERVAL_SECS", "40000")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_GAP_SECS", .. }));
    }

    #[test]
    fn test_window_lengths_parsing() {
        assert_eq!(parse_window_lengths("30, 7,7,1,3").unwrap(), vec![3, 7, 30]);
        assert!(parse_window_lengths("3,0").is_err());
        assert!(parse_window_lengths("3,week").is_err());
    }
}
