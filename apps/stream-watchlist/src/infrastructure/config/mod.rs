//! Configuration Module
//!
//! Configuration loading for the watchlist service.

mod settings;

pub use settings::{
    ConfigError, FeedSettings, ReconnectSettings, ServerSettings, WatchlistConfig,
    WatchlistSettings,
};
