//! Domain Layer - Subscription identity and the watchlist.
//!
//! Pure types with no I/O. Everything here can be driven synchronously
//! from tests.

/// Stream keys, wire states and entry states.
pub mod stream;

/// Stream-identifier map and per-entry delivery state.
pub mod watchlist;
