//! Channel-backed transport adapter.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::application::ports::{
    HandshakeStatus, SessionHandshake, StreamRequest, SubscriptionTransport, TransportError,
};
use crate::domain::stream::StreamId;

/// Commands handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Issue (or reissue) an item request.
    SendRequest(StreamRequest),
    /// Close a stream on the wire.
    CloseRequest(StreamId),
    /// Re-establish login and directory.
    Handshake,
    /// Attempt to reconnect after the delay.
    Reconnect {
        /// Backoff before the attempt.
        after: Duration,
    },
    /// Stop reconnecting.
    Shutdown,
}

impl TransportCommand {
    const fn name(&self) -> &'static str {
        match self {
            Self::SendRequest(_) => "send_request",
            Self::CloseRequest(_) => "close_request",
            Self::Handshake => "handshake",
            Self::Reconnect { .. } => "reconnect",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Queues outbound commands on a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<TransportCommand>,
}

impl ChannelTransport {
    /// Create a transport and the receiving half for the provider.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransportCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Wrap an existing sender.
    #[must_use]
    pub const fn from_sender(tx: mpsc::Sender<TransportCommand>) -> Self {
        Self { tx }
    }

    /// Queue a command without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Backpressure`] if the queue is full or
    /// [`TransportError::ChannelClosed`] if the provider is gone.
    pub fn enqueue(&self, command: TransportCommand) -> Result<(), TransportError> {
        let name = command.name();
        self.tx.try_send(command).map_err(|e| {
            tracing::debug!(command = name, "Transport command not queued");
            match e {
                TrySendError::Full(_) => TransportError::Backpressure,
                TrySendError::Closed(_) => TransportError::ChannelClosed,
            }
        })
    }
}

impl SubscriptionTransport for ChannelTransport {
    fn send_request(&self, request: &StreamRequest) -> Result<(), TransportError> {
        self.enqueue(TransportCommand::SendRequest(request.clone()))
    }

    fn close_request(&self, stream_id: StreamId) -> Result<(), TransportError> {
        self.enqueue(TransportCommand::CloseRequest(stream_id))
    }
}

impl SessionHandshake for ChannelTransport {
    fn reestablish(&self) -> Result<HandshakeStatus, TransportError> {
        self.enqueue(TransportCommand::Handshake)?;
        Ok(HandshakeStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stream::{DomainType, ServiceRef, StreamKey};

    fn request(stream_id: StreamId) -> StreamRequest {
        StreamRequest {
            stream_id,
            key: StreamKey::new(DomainType::MarketPrice, "IBM.N", ServiceRef::id(1)),
            view: None,
        }
    }

    #[test]
    fn queues_requests_in_order() {
        let (transport, mut rx) = ChannelTransport::new(4);

        transport.send_request(&request(5)).unwrap();
        transport.close_request(5).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportCommand::SendRequest(request(5))
        );
        assert_eq!(rx.try_recv().unwrap(), TransportCommand::CloseRequest(5));
    }

    #[test]
    fn full_queue_is_backpressure() {
        let (transport, _rx) = ChannelTransport::new(1);

        transport.send_request(&request(5)).unwrap();
        assert_eq!(
            transport.send_request(&request(6)),
            Err(TransportError::Backpressure)
        );
    }

    #[test]
    fn dropped_provider_is_channel_closed() {
        let (transport, rx) = ChannelTransport::new(1);
        drop(rx);

        assert_eq!(transport.close_request(5), Err(TransportError::ChannelClosed));
        assert_eq!(transport.reestablish(), Err(TransportError::ChannelClosed));
    }

    #[test]
    fn handshake_is_pending() {
        let (transport, mut rx) = ChannelTransport::new(1);

        assert_eq!(transport.reestablish(), Ok(HandshakeStatus::Pending));
        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Handshake);
    }
}
