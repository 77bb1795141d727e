//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `RecoveryController`: drives resends from connection-state changes
//! - `ReconnectPolicy`: backoff and attempt limit for reconnects

pub mod reconnect;
pub mod recovery;

pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use recovery::{
    ConnectionState, ReconnectDecision, RecoveryController, RecoveryError, SubscriptionError,
};
