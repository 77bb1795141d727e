#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Stream Watchlist - Subscription Tracking with Reconnection Recovery
//!
//! Tracks every item subscription a consumer has open against a streaming
//! market data provider, keyed by stream identifier, and reissues them
//! exactly once when the channel comes back after a disconnect.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `stream`: Stream keys, wire states, and the entry state mapping
//!   - `watchlist`: The subscription table and identifier allocation
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, handshake, and listener interfaces
//!   - `services`: Recovery controller and reconnect backoff
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `transport`: Channel transport, event dispatcher, loopback feed
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!  Application ──subscribe──► RecoveryController ──► Watchlist
//!                                   │    ▲
//!                 TransportCommand  │    │  TransportEvent
//!                                   ▼    │
//!                               Provider / LoopbackFeed
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core watchlist types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::stream::{
    DataState, DomainType, ServiceRef, StreamEvent, StreamEventKind, StreamId, StreamKey,
    StreamKeyError, StreamState, ViewSpec, WireStreamState,
};
pub use domain::watchlist::{
    Disposition, EntrySnapshot, EventOutcome, SubscribeOutcome, Watchlist, WatchlistEntry,
    WatchlistError, WatchlistLimits, WatchlistStats,
};

// Application ports and services
pub use application::ports::{
    HandshakeStatus, LoggingListener, SessionHandshake, StreamRequest, SubscriptionListener,
    SubscriptionTransport, TransportError, TransportListener,
};
pub use application::services::{
    ConnectionState, ReconnectConfig, ReconnectDecision, ReconnectPolicy, RecoveryController,
    RecoveryError, SubscriptionError,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedSettings, ReconnectSettings, ServerSettings, WatchlistConfig,
    WatchlistSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Transport adapters
pub use infrastructure::transport::{
    ChannelTransport, DispatchSummary, EventDispatcher, FeedControl, LoopbackFeed,
    TransportCommand, TransportEvent,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
