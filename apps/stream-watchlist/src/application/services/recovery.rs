//! Connection Recovery
//!
//! Turns channel-level connectivity events into stream-level resend
//! decisions and decides when a failure is surfaced to the application.
//!
//! # Connection States
//!
//! ```text
//!        channel down              channel up              session restored
//!  Up ───────────────► Down ───────────────► Recovering ───────────────────► Up
//!                       │  ▲                      │
//!                       │  └──── reconnect failed ┘
//!                       │
//!                       └── attempt limit exceeded ──► Failed (terminal)
//! ```
//!
//! Subscriptions survive channel loss. On channel down every open entry is
//! degraded to `OpenSuspect` and flagged for resend; once login and
//! directory are re-established, each flagged entry is reissued exactly
//! once under its original stream id.
//!
//! Locks are never held across calls into the ports, so adapters may call
//! back into the controller synchronously.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    HandshakeStatus, StreamRequest, SubscriptionListener, SubscriptionTransport,
    SessionHandshake, TransportListener,
};
use crate::domain::stream::{StreamEvent, StreamId, StreamKey, StreamState, ViewSpec};
use crate::domain::watchlist::{EventOutcome, SubscribeOutcome, Watchlist, WatchlistError};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Terminal recovery failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    /// The reconnect attempt budget is spent.
    #[error("reconnect attempt limit ({attempts}) exceeded: {last_reason}")]
    AttemptsExhausted {
        /// Failed attempts recorded.
        attempts: u32,
        /// Reason given for the last failed attempt.
        last_reason: String,
    },
}

/// Errors surfaced to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The watchlist rejected the subscription.
    #[error(transparent)]
    Watchlist(#[from] WatchlistError),

    /// Recovery has failed; the session must be re-created.
    #[error("session recovery failed: {0}")]
    RecoveryFailed(RecoveryError),
}

// =============================================================================
// States
// =============================================================================

/// Connection state as seen by the watchlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No channel; requests are held as resend flags.
    #[default]
    Down,
    /// Channel is back; waiting for login and directory.
    Recovering,
    /// Session established; requests go out immediately.
    Up,
    /// Recovery abandoned. Terminal.
    Failed,
}

impl ConnectionState {
    /// Short name used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Recovering => "recovering",
            Self::Up => "up",
            Self::Failed => "failed",
        }
    }

    /// Numeric code for the connection-state gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Down => 0.0,
            Self::Recovering => 1.0,
            Self::Up => 2.0,
            Self::Failed => -1.0,
        }
    }
}

/// What the transport should do after a failed reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after the delay.
    RetryAfter(Duration),
    /// Stop reconnecting; recovery has failed.
    GiveUp,
    /// The report did not apply in the current state.
    Ignored,
}

#[derive(Debug)]
struct ControllerState {
    connection: ConnectionState,
    policy: ReconnectPolicy,
    failure: Option<RecoveryError>,
    /// A send failed while up; the entry waits for the next retry pass.
    send_failed: bool,
}

/// Result of trying to send one flagged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    Sent,
    /// Connection not up; the flag stays set for recovery.
    Held,
    /// Nothing to send for this entry.
    Skipped,
    /// The transport refused the request; the entry is flagged again.
    Failed,
}

// =============================================================================
// Controller
// =============================================================================

/// Drives resends from connection-state changes.
pub struct RecoveryController {
    watchlist: Arc<Watchlist>,
    transport: Arc<dyn SubscriptionTransport>,
    session: Arc<dyn SessionHandshake>,
    listener: Arc<dyn SubscriptionListener>,
    state: Mutex<ControllerState>,
}

impl std::fmt::Debug for RecoveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryController")
            .field("connection", &self.connection_state())
            .field("entries", &self.watchlist.len())
            .finish_non_exhaustive()
    }
}

impl RecoveryController {
    /// Create a controller. The connection starts `Down`.
    #[must_use]
    pub fn new(
        watchlist: Arc<Watchlist>,
        transport: Arc<dyn SubscriptionTransport>,
        session: Arc<dyn SessionHandshake>,
        listener: Arc<dyn SubscriptionListener>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            watchlist,
            transport,
            session,
            listener,
            state: Mutex::new(ControllerState {
                connection: ConnectionState::Down,
                policy: ReconnectPolicy::new(reconnect),
                failure: None,
                send_failed: false,
            }),
        }
    }

    /// The watchlist this controller drives.
    #[must_use]
    pub const fn watchlist(&self) -> &Arc<Watchlist> {
        &self.watchlist
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    /// Failed reconnect attempts since the session was last up.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().policy.attempt_count()
    }

    fn is_up(&self) -> bool {
        self.connection_state() == ConnectionState::Up
    }

    fn failure(&self) -> Option<RecoveryError> {
        self.state.lock().failure.clone()
    }

    fn set_connection(state: &mut ControllerState, next: ConnectionState) {
        if state.connection != next {
            tracing::info!(
                from = state.connection.as_str(),
                to = next.as_str(),
                "Connection state changed"
            );
            state.connection = next;
            metrics::set_connection_state(next);
        }
    }

    // -------------------------------------------------------------------------
    // Application-facing operations
    // -------------------------------------------------------------------------

    /// Subscribe a key and request it on the wire.
    ///
    /// While the connection is not up the request is held and sent during
    /// recovery.
    ///
    /// # Errors
    ///
    /// Returns the watchlist error for invalid keys or identifier
    /// exhaustion, or [`SubscriptionError::RecoveryFailed`] once recovery
    /// has failed. The listener is notified of every error returned.
    pub fn subscribe(&self, key: StreamKey) -> Result<StreamId, SubscriptionError> {
        self.submit(key, None)
    }

    /// Subscribe a key with a payload view.
    ///
    /// # Errors
    ///
    /// Same as [`RecoveryController::subscribe`].
    pub fn subscribe_with_view(
        &self,
        key: StreamKey,
        view: ViewSpec,
    ) -> Result<StreamId, SubscriptionError> {
        self.submit(key, Some(view))
    }

    /// Subscribe several keys as one batch.
    ///
    /// # Errors
    ///
    /// Same as [`RecoveryController::subscribe`]; on error nothing from the
    /// batch is requested. The listener is told about the first key.
    pub fn subscribe_batch(&self, keys: Vec<StreamKey>) -> Result<Vec<StreamId>, SubscriptionError> {
        let first = keys.first().cloned();

        if let Some(failure) = self.failure() {
            let err = SubscriptionError::RecoveryFailed(failure);
            if let Some(key) = &first {
                self.report_failure(key, &err);
            }
            return Err(err);
        }

        match self.watchlist.subscribe_batch(keys) {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    self.dispatch(outcome);
                }
                Ok(outcomes.iter().map(|o| o.stream_id).collect())
            }
            Err(err) => {
                let err = SubscriptionError::from(err);
                if let Some(key) = &first {
                    self.report_failure(key, &err);
                }
                Err(err)
            }
        }
    }

    fn submit(&self, key: StreamKey, view: Option<ViewSpec>) -> Result<StreamId, SubscriptionError> {
        if let Some(failure) = self.failure() {
            let err = SubscriptionError::RecoveryFailed(failure);
            self.report_failure(&key, &err);
            return Err(err);
        }

        match self.watchlist.register(key.clone(), view) {
            Ok(outcome) => {
                self.dispatch(&outcome);
                Ok(outcome.stream_id)
            }
            Err(err) => {
                let err = SubscriptionError::from(err);
                self.report_failure(&key, &err);
                Err(err)
            }
        }
    }

    fn dispatch(&self, outcome: &SubscribeOutcome) {
        if !outcome.needs_request() {
            return;
        }

        metrics::record_subscription(outcome.disposition);
        self.watchlist.mark_needs_resend(outcome.stream_id);
        if self.flush(outcome.stream_id) == Flush::Held {
            tracing::debug!(
                stream_id = outcome.stream_id,
                "Connection not up; request held for recovery"
            );
        }
        metrics::set_watchlist_stats(&self.watchlist.stats());
    }

    fn report_failure(&self, key: &StreamKey, err: &SubscriptionError) {
        tracing::warn!(key = %key, error = %err, "Subscribe rejected");
        metrics::record_subscription_failure(err);
        self.listener.on_subscription_failed(key, err);
    }

    /// Drop a subscription. Idempotent.
    ///
    /// Later events for the identifier are ignored as stale. While the
    /// connection is up the stream is also closed on the wire.
    pub fn unregister(&self, stream_id: StreamId) {
        if self.watchlist.unregister(stream_id).is_none() {
            return;
        }

        if self.is_up()
            && let Err(e) = self.transport.close_request(stream_id)
        {
            tracing::warn!(stream_id, error = %e, "Failed to send close request");
        }
        metrics::set_watchlist_stats(&self.watchlist.stats());
    }

    /// Reissue every flagged entry now, if the connection is up.
    ///
    /// Returns the number of requests sent.
    pub fn resend_pending(&self) -> usize {
        {
            let mut state = self.state.lock();
            if state.connection != ConnectionState::Up {
                return 0;
            }
            state.send_failed = false;
        }

        let snapshot = self
            .watchlist
            .all_entries_needing(|e| e.needs_resend() && e.state().is_recoverable());

        let mut sent = 0;
        for (done, entry) in snapshot.iter().enumerate() {
            match self.flush(entry.stream_id()) {
                Flush::Sent => sent += 1,
                Flush::Held => {
                    tracing::info!(
                        remaining = snapshot.len() - done,
                        "Connection lost during resend; remaining requests held"
                    );
                    break;
                }
                Flush::Skipped | Flush::Failed => {}
            }
        }

        if sent > 0 {
            tracing::info!(count = sent, "Reissued subscriptions");
        }
        metrics::set_watchlist_stats(&self.watchlist.stats());
        sent
    }

    /// Reissue entries whose send failed while up.
    ///
    /// Returns the number of requests sent. Does nothing unless a send has
    /// failed since the last resend pass.
    pub fn retry_failed_sends(&self) -> usize {
        if !self.state.lock().send_failed {
            return 0;
        }
        self.resend_pending()
    }

    /// Claim one flagged entry and send it.
    ///
    /// The connection check and the claim happen under the controller lock,
    /// so a claim never overtakes `on_channel_down`. If the channel drops
    /// after the claim, `degrade_all` flags the entry again.
    fn flush(&self, stream_id: StreamId) -> Flush {
        let entry = {
            let state = self.state.lock();
            if state.connection != ConnectionState::Up {
                return Flush::Held;
            }
            match self.watchlist.claim_resend(stream_id) {
                Some(entry) => entry,
                None => return Flush::Skipped,
            }
        };

        let request = StreamRequest::from(&entry);
        match self.transport.send_request(&request) {
            Ok(()) => {
                metrics::record_request_sent();
                tracing::debug!(
                    stream_id,
                    item = entry.key().item_name(),
                    "Request sent"
                );
                Flush::Sent
            }
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "Failed to send request; will retry");
                let mut state = self.state.lock();
                self.watchlist.mark_needs_resend(stream_id);
                if state.connection == ConnectionState::Up {
                    state.send_failed = true;
                }
                Flush::Failed
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transport-facing operations
    // -------------------------------------------------------------------------

    /// The channel was lost.
    ///
    /// Open entries degrade to `OpenSuspect` and every recoverable entry is
    /// flagged for resend. No-op unless the connection was up.
    pub fn on_channel_down(&self) {
        let mut state = self.state.lock();
        if state.connection != ConnectionState::Up {
            tracing::debug!(
                state = state.connection.as_str(),
                "Channel down ignored"
            );
            return;
        }

        Self::set_connection(&mut state, ConnectionState::Down);
        let flagged = self.watchlist.degrade_all();
        drop(state);

        tracing::warn!(flagged, "Channel down; subscriptions held for recovery");
        metrics::set_watchlist_stats(&self.watchlist.stats());
    }

    /// The channel came back.
    ///
    /// Starts the login/directory handshake. Item requests are reissued
    /// once it completes. If the handshake cannot be started the attempt
    /// counts as failed and the reconnect decision is returned.
    pub fn on_channel_up(&self) -> Option<ReconnectDecision> {
        {
            let mut state = self.state.lock();
            match state.connection {
                ConnectionState::Down => Self::set_connection(&mut state, ConnectionState::Recovering),
                ConnectionState::Recovering => {
                    tracing::debug!("Channel up while recovering; restarting handshake");
                }
                ConnectionState::Up | ConnectionState::Failed => {
                    tracing::debug!(state = state.connection.as_str(), "Channel up ignored");
                    return None;
                }
            }
        }

        match self.session.reestablish() {
            Ok(HandshakeStatus::Complete) => {
                self.on_session_restored();
                None
            }
            Ok(HandshakeStatus::Pending) => {
                tracing::debug!("Waiting for login and directory");
                None
            }
            Err(e) => Some(self.on_reconnect_failed(&format!("handshake failed: {e}"))),
        }
    }

    /// Login and directory are re-established; reissue held requests.
    pub fn on_session_restored(&self) {
        {
            let mut state = self.state.lock();
            if state.connection != ConnectionState::Recovering {
                tracing::debug!(
                    state = state.connection.as_str(),
                    "Session restored ignored"
                );
                return;
            }
            state.policy.reset();
            state.send_failed = false;
            Self::set_connection(&mut state, ConnectionState::Up);
        }

        self.resend_pending();
    }

    /// A reconnect attempt failed.
    ///
    /// Returns the backoff before the next attempt, or `GiveUp` once the
    /// attempt limit is spent. Giving up moves the controller to `Failed`
    /// and notifies the listener exactly once.
    pub fn on_reconnect_failed(&self, reason: &str) -> ReconnectDecision {
        let failure = {
            let mut state = self.state.lock();
            match state.connection {
                ConnectionState::Failed => return ReconnectDecision::GiveUp,
                ConnectionState::Up => {
                    tracing::debug!(reason, "Reconnect failure reported while up; ignored");
                    return ReconnectDecision::Ignored;
                }
                ConnectionState::Down | ConnectionState::Recovering => {}
            }

            metrics::record_reconnect_attempt();
            Self::set_connection(&mut state, ConnectionState::Down);

            if let Some(delay) = state.policy.next_delay() {
                tracing::info!(
                    attempt = state.policy.attempt_count(),
                    delay_ms = delay.as_millis(),
                    reason,
                    "Reconnect attempt failed; retrying"
                );
                return ReconnectDecision::RetryAfter(delay);
            }

            let failure = RecoveryError::AttemptsExhausted {
                attempts: state.policy.attempt_count(),
                last_reason: reason.to_string(),
            };
            Self::set_connection(&mut state, ConnectionState::Failed);
            state.failure = Some(failure.clone());
            failure
        };

        tracing::error!(error = %failure, "Giving up on session recovery");
        self.listener.on_session_failed(&failure);
        ReconnectDecision::GiveUp
    }

    /// A refresh or status message arrived.
    pub fn on_stream_event(&self, event: &StreamEvent) {
        if self.connection_state() == ConnectionState::Failed {
            return;
        }

        match self.watchlist.apply_event(event) {
            EventOutcome::Stale => metrics::record_stale_event(),
            EventOutcome::Applied { previous, current } => {
                if current == StreamState::OpenOk {
                    // Only a refresh on the live session answers the request.
                    let state = self.state.lock();
                    if state.connection == ConnectionState::Up {
                        self.watchlist.clear_resend(event.stream_id);
                    }
                } else if current == StreamState::ClosedRecoverable && previous != current {
                    tracing::info!(
                        stream_id = event.stream_id,
                        "Stream closed recoverably; will reissue on recovery"
                    );
                    self.watchlist.mark_needs_resend(event.stream_id);
                }
            }
            EventOutcome::Evicted { current, .. } => {
                tracing::debug!(stream_id = event.stream_id, state = %current, "Stream finished");
                metrics::set_watchlist_stats(&self.watchlist.stats());
            }
        }
    }

    /// An update message arrived.
    pub fn on_update(&self, stream_id: StreamId) {
        if self.watchlist.on_update(stream_id) == EventOutcome::Stale {
            metrics::record_stale_event();
        }
    }
}

impl TransportListener for RecoveryController {
    fn notify_channel_down(&self) {
        self.on_channel_down();
    }

    fn notify_channel_up(&self) -> Option<ReconnectDecision> {
        self.on_channel_up()
    }

    fn notify_stream_event(&self, event: StreamEvent) {
        self.on_stream_event(&event);
    }

    fn notify_update(&self, stream_id: StreamId) {
        self.on_update(stream_id);
    }

    fn notify_session_restored(&self) {
        self.on_session_restored();
    }

    fn notify_reconnect_failed(&self, reason: &str) -> ReconnectDecision {
        self.on_reconnect_failed(reason)
    }

    fn notify_resend_due(&self) -> usize {
        self.retry_failed_sends()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::{
        MockSessionHandshake, MockSubscriptionListener, MockSubscriptionTransport, TransportError,
    };
    use crate::domain::stream::{DataState, DomainType, ServiceRef, WireStreamState};
    use crate::domain::watchlist::WatchlistLimits;

    fn key(item: &str) -> StreamKey {
        StreamKey::new(DomainType::MarketPrice, item, ServiceRef::name("DIRECT_FEED"))
    }

    fn complete_handshake() -> MockSessionHandshake {
        let mut session = MockSessionHandshake::new();
        session
            .expect_reestablish()
            .returning(|| Ok(HandshakeStatus::Complete));
        session
    }

    fn quiet_listener() -> MockSubscriptionListener {
        let mut listener = MockSubscriptionListener::new();
        listener.expect_on_subscription_failed().never();
        listener.expect_on_session_failed().never();
        listener
    }

    fn controller(
        transport: MockSubscriptionTransport,
        session: MockSessionHandshake,
        listener: MockSubscriptionListener,
        limit: u32,
    ) -> RecoveryController {
        RecoveryController::new(
            Arc::new(Watchlist::new()),
            Arc::new(transport),
            Arc::new(session),
            Arc::new(listener),
            ReconnectConfig {
                attempt_limit: limit,
                ..ReconnectConfig::default()
            }
            .without_jitter(),
        )
    }

    #[test]
    fn starts_down_and_holds_requests() {
        let mut transport = MockSubscriptionTransport::new();
        transport.expect_send_request().never();

        let ctl = controller(transport, MockSessionHandshake::new(), quiet_listener(), 0);
        let id = ctl.subscribe(key("IBM.N")).unwrap();

        assert_eq!(ctl.connection_state(), ConnectionState::Down);
        assert!(ctl.watchlist().lookup(id).unwrap().needs_resend());
    }

    #[test]
    fn held_requests_sent_once_on_recovery() {
        let mut transport = MockSubscriptionTransport::new();
        transport
            .expect_send_request()
            .withf(|req| req.stream_id == 5 && req.key.item_name() == "IBM.N")
            .times(1)
            .returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        ctl.subscribe(key("IBM.N")).unwrap();
        ctl.on_channel_up();

        assert_eq!(ctl.connection_state(), ConnectionState::Up);
        assert!(!ctl.watchlist().lookup(5).unwrap().needs_resend());
        // Nothing left to send.
        assert_eq!(ctl.resend_pending(), 0);
    }

    #[test]
    fn pending_handshake_defers_resend() {
        let mut transport = MockSubscriptionTransport::new();
        transport.expect_send_request().times(1).returning(|_| Ok(()));
        let mut session = MockSessionHandshake::new();
        session
            .expect_reestablish()
            .times(1)
            .returning(|| Ok(HandshakeStatus::Pending));

        let ctl = controller(transport, session, quiet_listener(), 0);
        ctl.subscribe(key("IBM.N")).unwrap();
        ctl.on_channel_up();
        assert_eq!(ctl.connection_state(), ConnectionState::Recovering);

        ctl.on_session_restored();
        assert_eq!(ctl.connection_state(), ConnectionState::Up);
    }

    #[test]
    fn channel_down_degrades_and_is_idempotent() {
        let mut transport = MockSubscriptionTransport::new();
        transport.expect_send_request().returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        ctl.on_channel_up();
        let id = ctl.subscribe(key("IBM.N")).unwrap();
        ctl.on_stream_event(&StreamEvent::refresh(id, WireStreamState::Open, DataState::Ok, false));

        ctl.on_channel_down();
        ctl.on_channel_down();

        let entry = ctl.watchlist().lookup(id).unwrap();
        assert_eq!(ctl.connection_state(), ConnectionState::Down);
        assert_eq!(entry.state(), StreamState::OpenSuspect);
        assert!(entry.needs_resend());
    }

    #[test]
    fn unregister_closes_on_wire_when_up() {
        let mut transport = MockSubscriptionTransport::new();
        transport.expect_send_request().returning(|_| Ok(()));
        transport
            .expect_close_request()
            .with(eq(5))
            .times(1)
            .returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        ctl.on_channel_up();
        let id = ctl.subscribe(key("IBM.N")).unwrap();

        ctl.unregister(id);
        ctl.unregister(id);
        assert!(ctl.watchlist().is_empty());
    }

    #[test]
    fn unregister_while_down_sends_nothing() {
        let mut transport = MockSubscriptionTransport::new();
        transport.expect_close_request().never();

        let ctl = controller(transport, MockSessionHandshake::new(), quiet_listener(), 0);
        let id = ctl.subscribe(key("IBM.N")).unwrap();
        ctl.unregister(id);
        assert!(ctl.watchlist().is_empty());
    }

    #[test]
    fn failed_send_is_retried_on_next_resend() {
        let mut transport = MockSubscriptionTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_send_request()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::Backpressure));
        transport
            .expect_send_request()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        ctl.on_channel_up();
        let id = ctl.subscribe(key("IBM.N")).unwrap();
        assert!(ctl.watchlist().lookup(id).unwrap().needs_resend());

        assert_eq!(ctl.resend_pending(), 1);
        assert!(!ctl.watchlist().lookup(id).unwrap().needs_resend());
    }

    #[test]
    fn invalid_key_reported_to_listener() {
        let mut listener = MockSubscriptionListener::new();
        listener
            .expect_on_subscription_failed()
            .withf(|key, reason| {
                key.item_name().is_empty()
                    && matches!(reason, SubscriptionError::Watchlist(WatchlistError::InvalidKey(_)))
            })
            .times(1)
            .return_const(());

        let ctl = controller(
            MockSubscriptionTransport::new(),
            MockSessionHandshake::new(),
            listener,
            0,
        );
        assert!(ctl.subscribe(key("")).is_err());
    }

    #[test]
    fn exhaustion_reported_to_listener() {
        let mut transport = MockSubscriptionTransport::new();
        transport.expect_send_request().returning(|_| Ok(()));
        let mut listener = MockSubscriptionListener::new();
        listener
            .expect_on_subscription_failed()
            .withf(|_, reason| {
                matches!(
                    reason,
                    SubscriptionError::Watchlist(WatchlistError::IdentifierSpaceExhausted { .. })
                )
            })
            .times(1)
            .return_const(());

        let ctl = RecoveryController::new(
            Arc::new(Watchlist::with_limits(WatchlistLimits {
                reserved_stream_ids: 4,
                max_stream_id: 5,
                item_count_hint: 1,
            })),
            Arc::new(transport),
            Arc::new(complete_handshake()),
            Arc::new(listener),
            ReconnectConfig::default(),
        );
        ctl.on_channel_up();
        ctl.subscribe(key("A")).unwrap();

        assert!(matches!(
            ctl.subscribe(key("B")),
            Err(SubscriptionError::Watchlist(
                WatchlistError::IdentifierSpaceExhausted { capacity: 1 }
            ))
        ));
    }

    #[test]
    fn attempt_limit_fails_once() {
        let mut listener = MockSubscriptionListener::new();
        listener.expect_on_session_failed().times(1).return_const(());
        listener
            .expect_on_subscription_failed()
            .withf(|_, reason| matches!(reason, SubscriptionError::RecoveryFailed(_)))
            .times(1)
            .return_const(());

        let ctl = controller(
            MockSubscriptionTransport::new(),
            MockSessionHandshake::new(),
            listener,
            2,
        );

        assert_eq!(
            ctl.on_reconnect_failed("refused"),
            ReconnectDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            ctl.on_reconnect_failed("refused"),
            ReconnectDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(ctl.on_reconnect_failed("refused"), ReconnectDecision::GiveUp);
        assert_eq!(ctl.on_reconnect_failed("refused"), ReconnectDecision::GiveUp);
        assert_eq!(ctl.connection_state(), ConnectionState::Failed);

        // Terminal: further channel events are ignored.
        ctl.on_channel_up();
        assert_eq!(ctl.connection_state(), ConnectionState::Failed);
        assert!(matches!(
            ctl.subscribe(key("IBM.N")),
            Err(SubscriptionError::RecoveryFailed(RecoveryError::AttemptsExhausted {
                attempts: 2,
                ..
            }))
        ));
    }

    #[test]
    fn handshake_error_counts_as_failed_attempt() {
        let mut session = MockSessionHandshake::new();
        session
            .expect_reestablish()
            .returning(|| Err(TransportError::Rejected("login denied".to_string())));

        let ctl = controller(MockSubscriptionTransport::new(), session, quiet_listener(), 0);

        assert_eq!(
            ctl.on_channel_up(),
            Some(ReconnectDecision::RetryAfter(Duration::from_secs(1)))
        );
        assert_eq!(ctl.connection_state(), ConnectionState::Down);
        assert_eq!(ctl.reconnect_attempts(), 1);
    }

    /// Transport that loses the channel in the middle of its first send.
    #[derive(Default)]
    struct DropsChannelOnFirstSend {
        controller: OnceLock<Weak<RecoveryController>>,
        sent: Mutex<Vec<StreamId>>,
    }

    impl SubscriptionTransport for DropsChannelOnFirstSend {
        fn send_request(&self, request: &StreamRequest) -> Result<(), TransportError> {
            let first = {
                let mut sent = self.sent.lock();
                sent.push(request.stream_id);
                sent.len() == 1
            };
            if first && let Some(ctl) = self.controller.get().and_then(Weak::upgrade) {
                ctl.on_channel_down();
            }
            Ok(())
        }

        fn close_request(&self, _stream_id: StreamId) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn channel_lost_mid_send_keeps_entry_for_recovery() {
        let transport = Arc::new(DropsChannelOnFirstSend::default());
        let ctl = Arc::new(RecoveryController::new(
            Arc::new(Watchlist::new()),
            transport.clone(),
            Arc::new(complete_handshake()),
            Arc::new(quiet_listener()),
            ReconnectConfig::default(),
        ));
        transport.controller.set(Arc::downgrade(&ctl)).unwrap();

        ctl.on_channel_up();
        let id = ctl.subscribe(key("IBM.N")).unwrap();

        assert_eq!(ctl.connection_state(), ConnectionState::Down);
        assert!(ctl.watchlist().lookup(id).unwrap().needs_resend());
        // Claims are refused once down.
        assert_eq!(ctl.resend_pending(), 0);
        assert_eq!(*transport.sent.lock(), vec![id]);

        ctl.on_channel_up();
        assert_eq!(*transport.sent.lock(), vec![id, id]);
        assert!(!ctl.watchlist().lookup(id).unwrap().needs_resend());
    }

    #[test]
    fn refresh_while_down_keeps_resend_flag() {
        let mut transport = MockSubscriptionTransport::new();
        transport
            .expect_send_request()
            .times(2)
            .returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        ctl.on_channel_up();
        let id = ctl.subscribe(key("IBM.N")).unwrap();
        ctl.on_channel_down();

        // A late refresh from the lost channel does not answer the resend.
        ctl.on_stream_event(&StreamEvent::refresh(id, WireStreamState::Open, DataState::Ok, false));
        assert!(ctl.watchlist().lookup(id).unwrap().needs_resend());

        ctl.on_channel_up();
        assert!(!ctl.watchlist().lookup(id).unwrap().needs_resend());
    }

    #[test]
    fn failed_send_retried_only_after_failure() {
        let mut transport = MockSubscriptionTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_send_request()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::Backpressure));
        transport
            .expect_send_request()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        assert_eq!(ctl.retry_failed_sends(), 0);
        ctl.on_channel_up();
        ctl.subscribe(key("IBM.N")).unwrap();

        assert_eq!(ctl.retry_failed_sends(), 1);
        assert_eq!(ctl.retry_failed_sends(), 0);
    }

    #[test]
    fn successful_recovery_resets_attempts() {
        let ctl = controller(
            MockSubscriptionTransport::new(),
            complete_handshake(),
            quiet_listener(),
            3,
        );
        let _ = ctl.on_reconnect_failed("timeout");
        let _ = ctl.on_reconnect_failed("timeout");
        assert_eq!(ctl.reconnect_attempts(), 2);

        ctl.on_channel_up();
        assert_eq!(ctl.connection_state(), ConnectionState::Up);
        assert_eq!(ctl.reconnect_attempts(), 0);
    }

    #[test]
    fn recoverable_close_reissued_on_recovery() {
        let mut transport = MockSubscriptionTransport::new();
        transport
            .expect_send_request()
            .with(mockall::predicate::function(|req: &StreamRequest| req.stream_id == 5))
            .times(2)
            .returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        ctl.on_channel_up();
        let id = ctl.subscribe(key("IBM.N")).unwrap();
        ctl.on_stream_event(&StreamEvent::status(
            id,
            WireStreamState::ClosedRecover,
            DataState::Suspect,
            false,
        ));
        assert_eq!(
            ctl.watchlist().lookup(id).unwrap().state(),
            StreamState::ClosedRecoverable
        );

        ctl.on_channel_down();
        ctl.on_channel_up();
        assert_eq!(ctl.watchlist().lookup(id).unwrap().state(), StreamState::Pending);
    }

    #[test]
    fn closed_stream_not_reissued() {
        let mut transport = MockSubscriptionTransport::new();
        transport.expect_send_request().times(1).returning(|_| Ok(()));

        let ctl = controller(transport, complete_handshake(), quiet_listener(), 0);
        ctl.on_channel_up();
        let id = ctl.subscribe(key("IBM.N")).unwrap();
        ctl.on_stream_event(&StreamEvent::status(
            id,
            WireStreamState::Closed,
            DataState::Suspect,
            false,
        ));

        ctl.on_channel_down();
        ctl.on_channel_up();
        assert_eq!(ctl.watchlist().lookup(id).unwrap().state(), StreamState::Closed);
    }
}
