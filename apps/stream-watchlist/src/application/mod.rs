//! Application Layer - Recovery orchestration and port definitions.
//!
//! This layer contains the recovery controller and the port interfaces
//! that define how the watchlist talks to the transport and to the
//! application that owns the subscriptions.

/// Port interfaces for external collaborators (transport, session, application).
pub mod ports;

/// Application services: connection recovery and reconnect backoff.
pub mod services;
