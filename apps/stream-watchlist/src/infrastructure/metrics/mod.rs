//! Prometheus Metrics Module
//!
//! Exposes watchlist and recovery metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Subscriptions**: requests issued and subscribe failures
//! - **Watchlist**: entry counts by stream state
//! - **Connection**: connection state and reconnect attempts
//! - **Events**: inbound events, including stale ones
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::services::{ConnectionState, SubscriptionError};
use crate::domain::watchlist::{Disposition, WatchlistStats};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Subscription counters
    describe_counter!(
        "stream_watchlist_subscriptions_total",
        "Subscribe calls that required a request, by disposition"
    );
    describe_counter!(
        "stream_watchlist_subscription_failures_total",
        "Subscribe calls rejected, by reason"
    );
    describe_counter!(
        "stream_watchlist_requests_sent_total",
        "Item requests handed to the transport"
    );

    // Watchlist gauges
    describe_gauge!(
        "stream_watchlist_entries",
        "Watchlist entries by stream state"
    );
    describe_gauge!(
        "stream_watchlist_awaiting_resend",
        "Entries flagged for resend"
    );

    // Connection
    describe_gauge!(
        "stream_watchlist_connection_state",
        "Connection state (-1 failed, 0 down, 1 recovering, 2 up)"
    );
    describe_counter!(
        "stream_watchlist_reconnect_attempts_total",
        "Failed reconnect attempts"
    );

    // Events
    describe_counter!(
        "stream_watchlist_events_received_total",
        "Inbound transport events by kind"
    );
    describe_counter!(
        "stream_watchlist_stale_events_total",
        "Events for identifiers no longer in the watchlist"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for inbound event kinds.
#[derive(Debug, Clone, Copy)]
pub enum EventKind {
    /// Refresh message.
    Refresh,
    /// Status message.
    Status,
    /// Update message.
    Update,
    /// Channel or session notification.
    Connection,
}

impl EventKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Status => "status",
            Self::Update => "update",
            Self::Connection => "connection",
        }
    }
}

const fn disposition_label(disposition: Disposition) -> &'static str {
    match disposition {
        Disposition::Created => "created",
        Disposition::Existing => "existing",
        Disposition::Reopened => "reopened",
        Disposition::ViewChanged => "view_changed",
    }
}

const fn failure_label(err: &SubscriptionError) -> &'static str {
    use crate::domain::watchlist::WatchlistError;

    match err {
        SubscriptionError::Watchlist(WatchlistError::InvalidKey(_)) => "invalid_key",
        SubscriptionError::Watchlist(WatchlistError::IdentifierSpaceExhausted { .. }) => {
            "exhausted"
        }
        SubscriptionError::RecoveryFailed(_) => "recovery_failed",
    }
}

/// Record a subscribe call that required a request.
pub fn record_subscription(disposition: Disposition) {
    counter!(
        "stream_watchlist_subscriptions_total",
        "disposition" => disposition_label(disposition)
    )
    .increment(1);
}

/// Record a rejected subscribe call.
pub fn record_subscription_failure(err: &SubscriptionError) {
    counter!(
        "stream_watchlist_subscription_failures_total",
        "reason" => failure_label(err)
    )
    .increment(1);
}

/// Record an item request handed to the transport.
pub fn record_request_sent() {
    counter!("stream_watchlist_requests_sent_total").increment(1);
}

/// Update watchlist gauges from a stats snapshot.
#[allow(clippy::cast_precision_loss)]
pub fn set_watchlist_stats(stats: &WatchlistStats) {
    let by_state = [
        ("pending", stats.pending),
        ("open_ok", stats.open_ok),
        ("open_suspect", stats.open_suspect),
        ("closed", stats.closed),
        ("closed_recoverable", stats.closed_recoverable),
    ];
    for (state, count) in by_state {
        gauge!("stream_watchlist_entries", "state" => state).set(count as f64);
    }
    gauge!("stream_watchlist_awaiting_resend").set(stats.awaiting_resend as f64);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("stream_watchlist_connection_state").set(state.gauge_value());
}

/// Record a failed reconnect attempt.
pub fn record_reconnect_attempt() {
    counter!("stream_watchlist_reconnect_attempts_total").increment(1);
}

/// Record an inbound transport event.
pub fn record_event_received(kind: EventKind) {
    counter!(
        "stream_watchlist_events_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record an event for an identifier no longer in the watchlist.
pub fn record_stale_event() {
    counter!("stream_watchlist_stale_events_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
