//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following the
//! Hexagonal Architecture pattern. These are the contracts that transport
//! adapters and applications implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`SubscriptionTransport`]: issue or close item requests on the wire
//! - [`SessionHandshake`]: re-establish login and directory after reconnect
//! - [`SubscriptionListener`]: failures surfaced to the application
//!
//! ## Driver Ports (Inbound)
//!
//! - [`TransportListener`]: channel and stream events from the transport

use thiserror::Error;

use crate::application::services::recovery::{
    ReconnectDecision, RecoveryError, SubscriptionError,
};
use crate::domain::stream::{StreamEvent, StreamId, StreamKey, ViewSpec};
use crate::domain::watchlist::WatchlistEntry;

// =============================================================================
// Errors
// =============================================================================

/// Errors reported by transport adapters.
///
/// These never reach the application; the recovery controller turns them
/// into resend flags or failed reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel to the transport is closed.
    #[error("transport channel closed")]
    ChannelClosed,

    /// The transport cannot accept more work right now.
    #[error("transport queue full")]
    Backpressure,

    /// The request was rejected.
    #[error("request rejected: {0}")]
    Rejected(String),
}

// =============================================================================
// Requests
// =============================================================================

/// An item request as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Stream identifier to issue the request on.
    pub stream_id: StreamId,
    /// Subscription key.
    pub key: StreamKey,
    /// Requested view, if any.
    pub view: Option<ViewSpec>,
}

impl From<&WatchlistEntry> for StreamRequest {
    fn from(entry: &WatchlistEntry) -> Self {
        Self {
            stream_id: entry.stream_id(),
            key: entry.key().clone(),
            view: entry.payload_view().cloned(),
        }
    }
}

/// Progress of a login/directory handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Login and directory are already re-established.
    Complete,
    /// The handshake is in flight; completion arrives as
    /// [`TransportListener::notify_session_restored`].
    Pending,
}

// =============================================================================
// Driven Ports
// =============================================================================

/// Outbound item requests.
///
/// Implementations must not block and must not call back into the
/// recovery controller from within these methods.
#[cfg_attr(test, mockall::automock)]
pub trait SubscriptionTransport: Send + Sync {
    /// Issue (or reissue) the request for a stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be queued.
    fn send_request(&self, request: &StreamRequest) -> Result<(), TransportError>;

    /// Close a stream on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the close could not be queued.
    fn close_request(&self, stream_id: StreamId) -> Result<(), TransportError>;
}

/// Login and directory re-establishment.
#[cfg_attr(test, mockall::automock)]
pub trait SessionHandshake: Send + Sync {
    /// Start re-establishing the session after the channel came back.
    ///
    /// # Errors
    ///
    /// An error counts as a failed reconnect attempt.
    fn reestablish(&self) -> Result<HandshakeStatus, TransportError>;
}

/// Failures surfaced to the application.
#[cfg_attr(test, mockall::automock)]
pub trait SubscriptionListener: Send + Sync {
    /// A subscribe call was rejected.
    fn on_subscription_failed(&self, key: &StreamKey, reason: &SubscriptionError);

    /// Automatic recovery gave up. Called at most once per controller.
    fn on_session_failed(&self, reason: &RecoveryError);
}

/// Listener that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl SubscriptionListener for LoggingListener {
    fn on_subscription_failed(&self, key: &StreamKey, reason: &SubscriptionError) {
        tracing::warn!(key = %key, error = %reason, "Subscription failed");
    }

    fn on_session_failed(&self, reason: &RecoveryError) {
        tracing::error!(error = %reason, "Session recovery failed");
    }
}

// =============================================================================
// Driver Ports
// =============================================================================

/// Inbound notifications from the transport layer.
pub trait TransportListener: Send + Sync {
    /// The channel to the provider was lost.
    fn notify_channel_down(&self);

    /// The channel to the provider is back.
    ///
    /// Returns a reconnect decision when the session handshake could not
    /// be started.
    fn notify_channel_up(&self) -> Option<ReconnectDecision>;

    /// A refresh or status message arrived.
    fn notify_stream_event(&self, event: StreamEvent);

    /// An update message arrived.
    fn notify_update(&self, stream_id: StreamId);

    /// Login and directory were re-established.
    fn notify_session_restored(&self);

    /// A reconnect attempt (or the handshake after it) failed.
    fn notify_reconnect_failed(&self, reason: &str) -> ReconnectDecision;

    /// The resend interval elapsed. Returns the number of requests reissued.
    fn notify_resend_due(&self) -> usize;
}
