//! Transport Adapters
//!
//! Connects the recovery controller to a provider over tokio channels.
//!
//! # Architecture
//!
//! ```text
//!   RecoveryController ──TransportCommand──► provider (e.g. LoopbackFeed)
//!          ▲                                        │
//!          └────── EventDispatcher ◄──TransportEvent┘
//! ```
//!
//! Outbound calls never block: [`ChannelTransport`] uses `try_send` and
//! reports a full queue as backpressure, which leaves the entry flagged for
//! the next resend. Inbound events are applied in arrival order by a single
//! [`EventDispatcher`] task.

mod channel;
mod dispatcher;
mod loopback;

pub use channel::{ChannelTransport, TransportCommand};
pub use dispatcher::{DispatchSummary, EventDispatcher, TransportEvent};
pub use loopback::{FeedControl, LoopbackFeed};
