//! Single-task dispatch of inbound transport events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelTransport, TransportCommand};
use crate::application::ports::TransportListener;
use crate::application::services::ReconnectDecision;
use crate::domain::stream::{StreamEvent, StreamEventKind, StreamId};
use crate::infrastructure::metrics::{self, EventKind};

/// Events delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel was lost.
    ChannelDown,
    /// The channel is back.
    ChannelUp,
    /// Login and directory were re-established.
    SessionRestored,
    /// A reconnect attempt or handshake failed.
    ReconnectFailed(String),
    /// Refresh or status message.
    Stream(StreamEvent),
    /// Update message.
    Update(StreamId),
}

impl TransportEvent {
    const fn kind(&self) -> EventKind {
        match self {
            Self::Stream(event) => match event.kind {
                StreamEventKind::Refresh => EventKind::Refresh,
                StreamEventKind::Status => EventKind::Status,
            },
            Self::Update(_) => EventKind::Update,
            Self::ChannelDown | Self::ChannelUp | Self::SessionRestored | Self::ReconnectFailed(_) => {
                EventKind::Connection
            }
        }
    }
}

/// Counts reported when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Events delivered to the listener.
    pub events: u64,
    /// Reconnect attempts scheduled with the provider.
    pub retries_scheduled: u64,
    /// Whether recovery was abandoned.
    pub gave_up: bool,
}

const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Delivers transport events to a listener, one at a time, in order.
///
/// Between events the listener is also told, every resend interval, to
/// retry requests whose send failed.
pub struct EventDispatcher {
    listener: Arc<dyn TransportListener>,
    events: mpsc::Receiver<TransportEvent>,
    commands: ChannelTransport,
    cancel: CancellationToken,
    resend_interval: Duration,
}

impl EventDispatcher {
    /// Create a dispatcher and the sender the provider publishes on.
    ///
    /// Reconnect decisions are sent back to the provider through
    /// `commands`.
    #[must_use]
    pub fn new(
        listener: Arc<dyn TransportListener>,
        commands: ChannelTransport,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<TransportEvent>) {
        let (tx, events) = mpsc::channel(capacity);
        (
            Self {
                listener,
                events,
                commands,
                cancel,
                resend_interval: DEFAULT_RESEND_INTERVAL,
            },
            tx,
        )
    }

    /// Set how often failed sends are retried. Must be non-zero.
    #[must_use]
    pub const fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    /// Run until cancelled or every sender is dropped.
    pub async fn run(mut self) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut resend = tokio::time::interval(self.resend_interval);
        resend.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::info!("Event dispatcher cancelled");
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Event channel closed");
                        break;
                    };
                    self.dispatch(event, &mut summary);
                }
                _ = resend.tick() => {
                    let sent = self.listener.notify_resend_due();
                    if sent > 0 {
                        tracing::debug!(sent, "Retried failed sends");
                    }
                }
            }
        }

        tracing::debug!(
            events = summary.events,
            retries = summary.retries_scheduled,
            "Event dispatcher stopped"
        );
        summary
    }

    fn dispatch(&self, event: TransportEvent, summary: &mut DispatchSummary) {
        metrics::record_event_received(event.kind());
        summary.events += 1;

        match event {
            TransportEvent::ChannelDown => self.listener.notify_channel_down(),
            TransportEvent::ChannelUp => {
                if let Some(decision) = self.listener.notify_channel_up() {
                    self.apply_decision(decision, summary);
                }
            }
            TransportEvent::SessionRestored => self.listener.notify_session_restored(),
            TransportEvent::Stream(event) => self.listener.notify_stream_event(event),
            TransportEvent::Update(stream_id) => self.listener.notify_update(stream_id),
            TransportEvent::ReconnectFailed(reason) => {
                let decision = self.listener.notify_reconnect_failed(&reason);
                self.apply_decision(decision, summary);
            }
        }
    }

    fn apply_decision(&self, decision: ReconnectDecision, summary: &mut DispatchSummary) {
        match decision {
            ReconnectDecision::RetryAfter(after) => {
                summary.retries_scheduled += 1;
                self.command(TransportCommand::Reconnect { after });
            }
            ReconnectDecision::GiveUp if !summary.gave_up => {
                summary.gave_up = true;
                self.command(TransportCommand::Shutdown);
            }
            ReconnectDecision::GiveUp | ReconnectDecision::Ignored => {}
        }
    }

    fn command(&self, command: TransportCommand) {
        if let Err(e) = self.commands.enqueue(command) {
            tracing::warn!(error = %e, "Failed to hand reconnect decision to transport");
        }
    }
}
