//! In-process simulated provider.
//!
//! Answers every item request with an open refresh, completes handshakes
//! immediately, and can be told to drop or refuse the channel. Used by the
//! demo binary and the integration tests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

use super::channel::TransportCommand;
use super::dispatcher::TransportEvent;
use crate::application::ports::TransportError;
use crate::domain::stream::{DataState, StreamEvent, StreamId, WireStreamState};

/// Handle for steering a [`LoopbackFeed`] from outside its task.
#[derive(Debug)]
pub struct FeedControl {
    available: AtomicBool,
    open: Mutex<BTreeSet<StreamId>>,
    events: mpsc::Sender<TransportEvent>,
}

impl FeedControl {
    fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            available: AtomicBool::new(false),
            open: Mutex::new(BTreeSet::new()),
            events,
        }
    }

    /// Whether the provider accepts connections.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Accept or refuse future connection attempts.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Streams the provider currently considers open.
    #[must_use]
    pub fn open_streams(&self) -> Vec<StreamId> {
        self.open.lock().iter().copied().collect()
    }

    /// Bring the channel up.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelClosed`] if the dispatcher is gone.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.set_available(true);
        tracing::info!("Loopback channel up");
        self.publish(TransportEvent::ChannelUp).await
    }

    /// Drop the channel. Open streams are forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelClosed`] if the dispatcher is gone.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.set_available(false);
        self.open.lock().clear();
        tracing::info!("Loopback channel down");
        self.publish(TransportEvent::ChannelDown).await
    }

    /// Close one stream from the provider side.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelClosed`] if the dispatcher is gone.
    pub async fn close_stream(
        &self,
        stream_id: StreamId,
        recoverable: bool,
    ) -> Result<(), TransportError> {
        self.open.lock().remove(&stream_id);
        let state = if recoverable {
            WireStreamState::ClosedRecover
        } else {
            WireStreamState::Closed
        };
        self.publish(TransportEvent::Stream(StreamEvent::status(
            stream_id,
            state,
            DataState::Suspect,
            false,
        )))
        .await
    }

    /// Publish a raw event.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelClosed`] if the dispatcher is gone.
    pub async fn publish(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Simulated provider driven by [`TransportCommand`]s.
pub struct LoopbackFeed {
    commands: mpsc::Receiver<TransportCommand>,
    control: Arc<FeedControl>,
    update_interval: Option<Duration>,
    cancel: CancellationToken,
}

impl LoopbackFeed {
    /// Create a feed. The channel starts unavailable; call
    /// [`FeedControl::connect`] to bring it up.
    #[must_use]
    pub fn new(
        commands: mpsc::Receiver<TransportCommand>,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            commands,
            control: Arc::new(FeedControl::new(events)),
            update_interval: None,
            cancel,
        }
    }

    /// Publish an update for every open stream at this interval.
    #[must_use]
    pub const fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Control handle for this feed.
    #[must_use]
    pub fn control(&self) -> Arc<FeedControl> {
        Arc::clone(&self.control)
    }

    /// Serve commands until cancelled, shut down, or the command channel
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelClosed`] if the dispatcher goes
    /// away while events are being published.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut ticker = self.update_interval.map(tokio::time::interval);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Loopback feed cancelled");
                    return Ok(());
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!("Command channel closed");
                        return Ok(());
                    };
                    if !self.handle(command).await? {
                        return Ok(());
                    }
                }
                () = tick(&mut ticker) => self.publish_updates().await?,
            }
        }
    }

    /// Returns `false` when the feed should stop.
    async fn handle(&self, command: TransportCommand) -> Result<bool, TransportError> {
        match command {
            TransportCommand::SendRequest(request) => {
                if !self.control.is_available() {
                    tracing::debug!(
                        stream_id = request.stream_id,
                        "Request dropped; channel unavailable"
                    );
                    return Ok(true);
                }
                self.control.open.lock().insert(request.stream_id);
                tracing::debug!(
                    stream_id = request.stream_id,
                    item = request.key.item_name(),
                    "Loopback refresh"
                );
                self.control
                    .publish(TransportEvent::Stream(StreamEvent::refresh(
                        request.stream_id,
                        WireStreamState::Open,
                        DataState::Ok,
                        false,
                    )))
                    .await?;
            }
            TransportCommand::CloseRequest(stream_id) => {
                self.control.open.lock().remove(&stream_id);
            }
            TransportCommand::Handshake => {
                let event = if self.control.is_available() {
                    TransportEvent::SessionRestored
                } else {
                    TransportEvent::ReconnectFailed("login refused".to_string())
                };
                self.control.publish(event).await?;
            }
            TransportCommand::Reconnect { after } => {
                tokio::select! {
                    () = self.cancel.cancelled() => return Ok(false),
                    () = tokio::time::sleep(after) => {}
                }
                let event = if self.control.is_available() {
                    TransportEvent::ChannelUp
                } else {
                    TransportEvent::ReconnectFailed("connection refused".to_string())
                };
                self.control.publish(event).await?;
            }
            TransportCommand::Shutdown => {
                tracing::warn!("Loopback feed shut down by controller");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn publish_updates(&self) -> Result<(), TransportError> {
        if !self.control.is_available() {
            return Ok(());
        }
        for stream_id in self.control.open_streams() {
            self.control.publish(TransportEvent::Update(stream_id)).await?;
        }
        Ok(())
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::StreamRequest;
    use crate::domain::stream::{DomainType, ServiceRef, StreamKey};

    fn request(stream_id: StreamId) -> StreamRequest {
        StreamRequest {
            stream_id,
            key: StreamKey::new(DomainType::MarketPrice, "IBM.N", ServiceRef::id(1)),
            view: None,
        }
    }

    fn feed() -> (
        LoopbackFeed,
        mpsc::Sender<TransportCommand>,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (evt_tx, evt_rx) = mpsc::channel(8);
        (
            LoopbackFeed::new(cmd_rx, evt_tx, CancellationToken::new()),
            cmd_tx,
            evt_rx,
        )
    }

    #[tokio::test]
    async fn answers_requests_with_open_refresh() {
        let (feed, commands, mut events) = feed();
        let control = feed.control();
        control.set_available(true);
        let task = tokio::spawn(feed.run());

        commands
            .send(TransportCommand::SendRequest(request(5)))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Stream(StreamEvent::refresh(
                5,
                WireStreamState::Open,
                DataState::Ok,
                false
            ))
        );
        assert_eq!(control.open_streams(), vec![5]);

        drop(commands);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_refused_while_unavailable() {
        let (feed, commands, mut events) = feed();
        let task = tokio::spawn(feed.run());

        commands.send(TransportCommand::Handshake).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::ReconnectFailed("login refused".to_string())
        );

        commands.send(TransportCommand::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnect_waits_for_backoff() {
        let (feed, commands, mut events) = feed();
        let control = feed.control();
        let task = tokio::spawn(feed.run());

        control.set_available(true);
        commands
            .send(TransportCommand::Reconnect {
                after: Duration::from_millis(20),
            })
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), TransportEvent::ChannelUp);

        drop(commands);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_forgets_open_streams() {
        let (feed, _commands, mut events) = feed();
        let control = feed.control();
        control.open.lock().insert(5);

        control.disconnect().await.unwrap();

        assert!(control.open_streams().is_empty());
        assert!(!control.is_available());
        assert_eq!(events.recv().await.unwrap(), TransportEvent::ChannelDown);
    }
}
