//! Watchlist Configuration Settings
//!
//! Configuration types for the watchlist service, loaded from environment
//! variables.

use std::time::Duration;

use crate::domain::stream::{MAX_STREAM_ID, RESERVED_STREAM_IDS, StreamId};
use crate::domain::watchlist::WatchlistLimits;

/// Stream identifier settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchlistSettings {
    /// Identifiers `1..=reserved_stream_ids` are never allocated.
    pub reserved_stream_ids: StreamId,
    /// Largest identifier before wrapping.
    pub max_stream_id: StreamId,
    /// Expected number of items, used to size the tables.
    pub item_count_hint: usize,
}

impl Default for WatchlistSettings {
    fn default() -> Self {
        Self {
            reserved_stream_ids: RESERVED_STREAM_IDS,
            max_stream_id: MAX_STREAM_ID,
            item_count_hint: 1024,
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Failed attempts tolerated before giving up (0 = unlimited).
    pub attempt_limit: u32,
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
    /// Delay multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            attempt_limit: 0, // Unlimited
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            multiplier: 2.0,
        }
    }
}

/// Transport event channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    /// Capacity of the inbound event channel.
    pub event_channel_capacity: usize,
    /// How often requests whose send failed are retried while up.
    pub resend_interval: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            event_channel_capacity: 1024,
            resend_interval: Duration::from_millis(1000),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete watchlist configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WatchlistConfig {
    /// Stream identifier settings.
    pub watchlist: WatchlistSettings,
    /// Reconnect backoff settings.
    pub reconnect: ReconnectSettings,
    /// Transport event channel settings.
    pub feed: FeedSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl WatchlistConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparseable variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting values are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let watchlist = WatchlistSettings {
            reserved_stream_ids: parse_env_i64(
                "WATCHLIST_RESERVED_STREAM_IDS",
                defaults.watchlist.reserved_stream_ids,
            ),
            max_stream_id: parse_env_i64(
                "WATCHLIST_MAX_STREAM_ID",
                defaults.watchlist.max_stream_id,
            ),
            item_count_hint: parse_env_usize(
                "WATCHLIST_ITEM_COUNT_HINT",
                defaults.watchlist.item_count_hint,
            ),
        };

        let reconnect = ReconnectSettings {
            attempt_limit: parse_env_u32(
                "WATCHLIST_RECONNECT_ATTEMPT_LIMIT",
                defaults.reconnect.attempt_limit,
            ),
            min_delay: parse_env_duration_millis(
                "WATCHLIST_RECONNECT_MIN_DELAY_MS",
                defaults.reconnect.min_delay,
            ),
            max_delay: parse_env_duration_millis(
                "WATCHLIST_RECONNECT_MAX_DELAY_MS",
                defaults.reconnect.max_delay,
            ),
            multiplier: parse_env_f64(
                "WATCHLIST_RECONNECT_MULTIPLIER",
                defaults.reconnect.multiplier,
            ),
        };

        let feed = FeedSettings {
            event_channel_capacity: parse_env_usize(
                "WATCHLIST_EVENT_CHANNEL_CAPACITY",
                defaults.feed.event_channel_capacity,
            ),
            resend_interval: parse_env_duration_millis(
                "WATCHLIST_RESEND_INTERVAL_MS",
                defaults.feed.resend_interval,
            ),
        };

        let server = ServerSettings {
            health_port: parse_env_u16("WATCHLIST_HEALTH_PORT", defaults.server.health_port),
        };

        let config = Self {
            watchlist,
            reconnect,
            feed,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.watchlist;
        if w.reserved_stream_ids < 0 || w.reserved_stream_ids >= w.max_stream_id {
            return Err(ConfigError::InvalidStreamIdRange {
                reserved: w.reserved_stream_ids,
                max: w.max_stream_id,
            });
        }

        let r = &self.reconnect;
        if r.min_delay > r.max_delay {
            return Err(ConfigError::InvalidValue {
                key: "WATCHLIST_RECONNECT_MIN_DELAY_MS",
                reason: "exceeds WATCHLIST_RECONNECT_MAX_DELAY_MS".to_string(),
            });
        }
        if !r.multiplier.is_finite() || r.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "WATCHLIST_RECONNECT_MULTIPLIER",
                reason: format!("{} is not a finite value >= 1.0", r.multiplier),
            });
        }

        if self.feed.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WATCHLIST_EVENT_CHANNEL_CAPACITY",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.feed.resend_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "WATCHLIST_RESEND_INTERVAL_MS",
                reason: "must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Watchlist limits derived from the identifier settings.
    #[must_use]
    pub const fn limits(&self) -> WatchlistLimits {
        WatchlistLimits {
            reserved_stream_ids: self.watchlist.reserved_stream_ids,
            max_stream_id: self.watchlist.max_stream_id,
            item_count_hint: self.watchlist.item_count_hint,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The reserved range leaves no identifiers to allocate.
    #[error("invalid stream id range: reserved {reserved}, max {max}")]
    InvalidStreamIdRange {
        /// Reserved identifier count.
        reserved: StreamId,
        /// Largest identifier.
        max: StreamId,
    },
    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Environment variable name.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchlist_settings_defaults() {
        let settings = WatchlistSettings::default();
        assert_eq!(settings.reserved_stream_ids, 4);
        assert_eq!(settings.max_stream_id, 2_147_483_647);
        assert_eq!(settings.item_count_hint, 1024);
    }

    #[test]
    fn reconnect_settings_defaults() {
        let settings = ReconnectSettings::default();
        assert_eq!(settings.attempt_limit, 0);
        assert_eq!(settings.min_delay, Duration::from_millis(1000));
        assert_eq!(settings.max_delay, Duration::from_millis(5000));
        assert!((settings.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_resend_interval_rejected() {
        let mut config = WatchlistConfig::default();
        assert_eq!(config.feed.resend_interval, Duration::from_secs(1));
        config.feed.resend_interval = Duration::ZERO;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "WATCHLIST_RESEND_INTERVAL_MS",
                ..
            })
        ));
    }

    #[test]
    fn server_settings_defaults() {
        assert_eq!(ServerSettings::default().health_port, 8083);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(WatchlistConfig::default().validate().is_ok());
    }

    #[test]
    fn reserved_range_must_leave_room() {
        let mut config = WatchlistConfig::default();
        config.watchlist.max_stream_id = 4;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidStreamIdRange { reserved: 4, max: 4 })
        ));
    }

    #[test]
    fn inverted_delays_rejected() {
        let mut config = WatchlistConfig::default();
        config.reconnect.min_delay = Duration::from_secs(10);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "WATCHLIST_RECONNECT_MIN_DELAY_MS",
                ..
            })
        ));
    }

    #[test]
    fn shrinking_multiplier_rejected() {
        let mut config = WatchlistConfig::default();
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn limits_follow_settings() {
        let mut config = WatchlistConfig::default();
        config.watchlist.max_stream_id = 100;

        let limits = config.limits();
        assert_eq!(limits.reserved_stream_ids, 4);
        assert_eq!(limits.max_stream_id, 100);
    }
}
