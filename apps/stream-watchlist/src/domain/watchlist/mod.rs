//! Subscription Watchlist
//!
//! The authoritative map between application subscriptions ([`StreamKey`])
//! and wire stream identifiers ([`StreamId`]), and the single source of
//! truth for each subscription's last-known delivery state.
//!
//! # Design
//!
//! The watchlist tracks:
//! - One [`WatchlistEntry`] per stream id, and the reverse key index
//! - Identifier allocation with wrap-around (see [`allocator`])
//! - Which entries must be re-requested once the connection recovers
//!
//! All state lives behind one mutex per watchlist. Callers receive copies
//! of entries, never references into the map, so transport I/O can be done
//! after the lock is released.

pub mod allocator;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::stream::{
    DataState, MAX_STREAM_ID, RESERVED_STREAM_IDS, ServiceRef, StreamEvent, StreamId, StreamKey,
    StreamKeyError, StreamState, ViewSpec, WireStreamState,
};

pub use allocator::StreamIdAllocator;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by watchlist operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchlistError {
    /// The key cannot be subscribed.
    #[error("invalid stream key: {0}")]
    InvalidKey(#[from] StreamKeyError),

    /// Every allocatable identifier is held by a live entry.
    #[error("stream identifier space exhausted ({capacity} identifiers in use)")]
    IdentifierSpaceExhausted {
        /// Number of allocatable identifiers.
        capacity: StreamId,
    },
}

// =============================================================================
// Limits
// =============================================================================

/// Sizing limits for a watchlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchlistLimits {
    /// Highest reserved identifier; allocation starts just above it.
    pub reserved_stream_ids: StreamId,
    /// Highest identifier that may be allocated.
    pub max_stream_id: StreamId,
    /// Expected number of items, used to pre-size the maps.
    pub item_count_hint: usize,
}

impl Default for WatchlistLimits {
    fn default() -> Self {
        Self {
            reserved_stream_ids: RESERVED_STREAM_IDS,
            max_stream_id: MAX_STREAM_ID,
            item_count_hint: 1024,
        }
    }
}

// =============================================================================
// Entry
// =============================================================================

/// Snapshot of one subscription's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchlistEntry {
    stream_id: StreamId,
    key: StreamKey,
    state: StreamState,
    payload_view: Option<ViewSpec>,
    is_batch_member: bool,
    needs_resend: bool,
}

impl WatchlistEntry {
    fn new(stream_id: StreamId, key: StreamKey, view: Option<ViewSpec>, batch: bool) -> Self {
        Self {
            stream_id,
            key,
            state: StreamState::Pending,
            payload_view: view,
            is_batch_member: batch,
            needs_resend: false,
        }
    }

    /// Wire stream identifier.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Subscription key, exactly as supplied by the subscriber.
    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Current delivery state.
    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Requested view, if any.
    #[must_use]
    pub const fn payload_view(&self) -> Option<&ViewSpec> {
        self.payload_view.as_ref()
    }

    /// Whether the entry was created by a batch request.
    #[must_use]
    pub const fn is_batch_member(&self) -> bool {
        self.is_batch_member
    }

    /// Whether the request must be reissued once the connection is up.
    #[must_use]
    pub const fn needs_resend(&self) -> bool {
        self.needs_resend
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// What a subscribe call did to the watchlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A new entry was created.
    Created,
    /// A live entry already existed for the key; nothing changed.
    Existing,
    /// A recoverably-closed entry was reopened under its old id.
    Reopened,
    /// A live entry existed and its view was replaced.
    ViewChanged,
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Identifier of the entry for the key.
    pub stream_id: StreamId,
    /// What happened.
    pub disposition: Disposition,
}

impl SubscribeOutcome {
    /// Whether a request must go out on the wire for this outcome.
    #[must_use]
    pub const fn needs_request(&self) -> bool {
        !matches!(self.disposition, Disposition::Existing)
    }
}

/// Result of applying an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The entry was updated and remains in the watchlist.
    Applied {
        /// State before the event.
        previous: StreamState,
        /// State after the event.
        current: StreamState,
    },
    /// The entry reached a final terminal state and was evicted.
    Evicted {
        /// State before the event.
        previous: StreamState,
        /// Terminal state the entry ended in.
        current: StreamState,
    },
    /// No entry exists for the identifier (already unregistered).
    Stale,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time copy of a set of entries.
///
/// Iterating does not touch the watchlist, and the snapshot can be iterated
/// any number of times.
#[derive(Debug, Clone, Default)]
pub struct EntrySnapshot {
    entries: Arc<[WatchlistEntry]>,
}

impl EntrySnapshot {
    /// Iterate the entries.
    pub fn iter(&self) -> std::slice::Iter<'_, WatchlistEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stream identifiers in the snapshot.
    #[must_use]
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.entries.iter().map(WatchlistEntry::stream_id).collect()
    }
}

impl<'a> IntoIterator for &'a EntrySnapshot {
    type Item = &'a WatchlistEntry;
    type IntoIter = std::slice::Iter<'a, WatchlistEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Entry counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WatchlistStats {
    /// Total entries.
    pub total: usize,
    /// Entries awaiting their first refresh.
    pub pending: usize,
    /// Open entries with good data.
    pub open_ok: usize,
    /// Open entries with suspect data.
    pub open_suspect: usize,
    /// Closed entries not yet evicted.
    pub closed: usize,
    /// Recoverably-closed entries.
    pub closed_recoverable: usize,
    /// Entries flagged for resend.
    pub awaiting_resend: usize,
}

// =============================================================================
// Watchlist
// =============================================================================

#[derive(Debug)]
struct WatchlistState {
    entries: HashMap<StreamId, WatchlistEntry>,
    /// Canonical key to stream id.
    index: HashMap<StreamKey, StreamId>,
    allocator: StreamIdAllocator,
}

impl WatchlistState {
    fn evict(&mut self, stream_id: StreamId, services: &HashMap<String, u16>) -> Option<WatchlistEntry> {
        let entry = self.entries.remove(&stream_id)?;
        let canonical = canonical_key(&entry.key, services);
        if self.index.get(&canonical) == Some(&stream_id) {
            self.index.remove(&canonical);
        }
        Some(entry)
    }

    fn allocate(&mut self, services: &HashMap<String, u16>) -> Result<StreamId, WatchlistError> {
        let entries = &self.entries;
        let stream_id = self
            .allocator
            .allocate(|id| entries.get(&id).is_some_and(|e| e.state.is_live()))
            .ok_or(WatchlistError::IdentifierSpaceExhausted {
                capacity: self.allocator.capacity(),
            })?;

        // After a wrap the id may still be held by a terminal entry.
        if let Some(old) = self.evict(stream_id, services) {
            tracing::debug!(
                stream_id,
                item = old.key.item_name(),
                state = %old.state,
                "Reclaiming identifier from terminal entry"
            );
        }

        Ok(stream_id)
    }
}

/// Map of subscriptions to stream identifiers.
///
/// # Example
///
/// ```rust
/// use stream_watchlist::domain::stream::{
///     DataState, DomainType, ServiceRef, StreamKey, StreamState, WireStreamState,
/// };
/// use stream_watchlist::domain::watchlist::Watchlist;
///
/// let watchlist = Watchlist::new();
/// let key = StreamKey::new(DomainType::MarketPrice, "IBM.N", ServiceRef::name("DIRECT_FEED"));
///
/// let id = watchlist.subscribe(key.clone()).unwrap();
/// assert_eq!(id, 5);
/// assert_eq!(watchlist.subscribe(key.clone()).unwrap(), id);
///
/// watchlist.on_refresh_or_status(id, WireStreamState::Open, DataState::Ok, false);
/// assert_eq!(watchlist.lookup(id).unwrap().state(), StreamState::OpenOk);
/// ```
#[derive(Debug)]
pub struct Watchlist {
    state: Mutex<WatchlistState>,
    services: HashMap<String, u16>,
}

impl Default for Watchlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchlist {
    /// Create a watchlist with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(WatchlistLimits::default())
    }

    /// Create a watchlist with the given limits.
    #[must_use]
    pub fn with_limits(limits: WatchlistLimits) -> Self {
        Self::with_services(limits, HashMap::new())
    }

    /// Create a watchlist that resolves service names to ids.
    ///
    /// Keys naming a service in `services` and keys using its id are
    /// treated as the same subscription.
    #[must_use]
    pub fn with_services(limits: WatchlistLimits, services: HashMap<String, u16>) -> Self {
        Self {
            state: Mutex::new(WatchlistState {
                entries: HashMap::with_capacity(limits.item_count_hint),
                index: HashMap::with_capacity(limits.item_count_hint),
                allocator: StreamIdAllocator::new(
                    limits.reserved_stream_ids,
                    limits.max_stream_id,
                ),
            }),
            services,
        }
    }

    /// Subscribe a key, returning its stream identifier.
    ///
    /// Subscribing a key that already has a live entry returns the existing
    /// identifier.
    ///
    /// # Errors
    ///
    /// Returns [`WatchlistError::InvalidKey`] for an unusable key, or
    /// [`WatchlistError::IdentifierSpaceExhausted`] when no identifier is free.
    pub fn subscribe(&self, key: StreamKey) -> Result<StreamId, WatchlistError> {
        self.register(key, None).map(|outcome| outcome.stream_id)
    }

    /// Subscribe a key with a payload view.
    ///
    /// # Errors
    ///
    /// Same as [`Watchlist::subscribe`].
    pub fn subscribe_with_view(
        &self,
        key: StreamKey,
        view: ViewSpec,
    ) -> Result<SubscribeOutcome, WatchlistError> {
        self.register(key, Some(view))
    }

    /// Subscribe a key, reporting what changed.
    ///
    /// # Errors
    ///
    /// Same as [`Watchlist::subscribe`].
    pub fn register(
        &self,
        key: StreamKey,
        view: Option<ViewSpec>,
    ) -> Result<SubscribeOutcome, WatchlistError> {
        key.validate()?;
        let mut state = self.state.lock();
        self.register_locked(&mut state, key, view, false)
    }

    /// Subscribe several keys as one batch.
    ///
    /// All keys are validated before anything is allocated. If the
    /// identifier space runs out part-way, entries created by this call are
    /// removed, entries it reopened are put back as they were, and the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Same as [`Watchlist::subscribe`].
    pub fn subscribe_batch(
        &self,
        keys: impl IntoIterator<Item = StreamKey>,
    ) -> Result<Vec<SubscribeOutcome>, WatchlistError> {
        let keys: Vec<StreamKey> = keys.into_iter().collect();
        for key in &keys {
            key.validate()?;
        }

        let mut state = self.state.lock();
        let mut outcomes = Vec::with_capacity(keys.len());
        let mut reopened = Vec::new();

        for key in keys {
            let prior = state
                .index
                .get(&canonical_key(&key, &self.services))
                .and_then(|id| state.entries.get(id))
                .filter(|e| e.state == StreamState::ClosedRecoverable)
                .cloned();

            match self.register_locked(&mut state, key, None, true) {
                Ok(outcome) => {
                    if outcome.disposition == Disposition::Reopened
                        && let Some(prior) = prior
                    {
                        reopened.push(prior);
                    }
                    outcomes.push(outcome);
                }
                Err(err) => {
                    for outcome in &outcomes {
                        if outcome.disposition == Disposition::Created {
                            state.evict(outcome.stream_id, &self.services);
                        }
                    }
                    for prior in reopened {
                        state.entries.insert(prior.stream_id, prior);
                    }
                    tracing::warn!(
                        error = %err,
                        rolled_back = outcomes.len(),
                        "Batch subscribe failed"
                    );
                    return Err(err);
                }
            }
        }

        tracing::debug!(count = outcomes.len(), "Batch subscribed");
        Ok(outcomes)
    }

    fn register_locked(
        &self,
        state: &mut WatchlistState,
        key: StreamKey,
        view: Option<ViewSpec>,
        batch: bool,
    ) -> Result<SubscribeOutcome, WatchlistError> {
        let canonical = canonical_key(&key, &self.services);

        if let Some(&stream_id) = state.index.get(&canonical) {
            if let Some(entry) = state.entries.get_mut(&stream_id) {
                let disposition = match entry.state {
                    StreamState::Closed => None,
                    StreamState::ClosedRecoverable => {
                        entry.state = StreamState::Pending;
                        entry.needs_resend = false;
                        if view.is_some() {
                            entry.payload_view = view.clone();
                        }
                        Some(Disposition::Reopened)
                    }
                    _ if view.is_some() && view != entry.payload_view => {
                        entry.payload_view = view.clone();
                        Some(Disposition::ViewChanged)
                    }
                    _ => Some(Disposition::Existing),
                };

                if let Some(disposition) = disposition {
                    tracing::debug!(stream_id, item = key.item_name(), ?disposition, "Subscribe");
                    return Ok(SubscribeOutcome {
                        stream_id,
                        disposition,
                    });
                }
            }

            // Closed entries (or a dangling index slot) give way to a new stream.
            state.evict(stream_id, &self.services);
            state.index.remove(&canonical);
        }

        let stream_id = state.allocate(&self.services)?;
        tracing::debug!(
            stream_id,
            item = key.item_name(),
            domain = %key.domain(),
            service = %key.service(),
            "Allocated stream"
        );

        state.index.insert(canonical, stream_id);
        state
            .entries
            .insert(stream_id, WatchlistEntry::new(stream_id, key, view, batch));

        Ok(SubscribeOutcome {
            stream_id,
            disposition: Disposition::Created,
        })
    }

    /// Apply a refresh or status message to its entry.
    ///
    /// Unknown identifiers are ignored and reported as [`EventOutcome::Stale`].
    pub fn on_refresh_or_status(
        &self,
        stream_id: StreamId,
        stream_state: WireStreamState,
        data_state: DataState,
        is_final: bool,
    ) -> EventOutcome {
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get_mut(&stream_id) else {
            tracing::debug!(stream_id, "Ignoring event for stale stream id");
            return EventOutcome::Stale;
        };

        let previous = entry.state;
        let mut current = previous.apply(stream_state, data_state);
        if stream_state == WireStreamState::NonStreaming && is_final {
            current = StreamState::Closed;
        }
        entry.state = current;

        if previous != current {
            tracing::debug!(
                stream_id,
                item = entry.key.item_name(),
                from = %previous,
                to = %current,
                "Stream state changed"
            );
        }

        if current.is_terminal() && is_final {
            state.evict(stream_id, &self.services);
            return EventOutcome::Evicted { previous, current };
        }

        EventOutcome::Applied { previous, current }
    }

    /// Apply a [`StreamEvent`].
    pub fn apply_event(&self, event: &StreamEvent) -> EventOutcome {
        self.on_refresh_or_status(
            event.stream_id,
            event.stream_state,
            event.data_state,
            event.is_final,
        )
    }

    /// Record an update message. Updates never change delivery state.
    pub fn on_update(&self, stream_id: StreamId) -> EventOutcome {
        let state = self.state.lock();
        state.entries.get(&stream_id).map_or_else(
            || {
                tracing::trace!(stream_id, "Ignoring update for stale stream id");
                EventOutcome::Stale
            },
            |entry| EventOutcome::Applied {
                previous: entry.state,
                current: entry.state,
            },
        )
    }

    /// Remove an entry regardless of its state. No-op if absent.
    pub fn unregister(&self, stream_id: StreamId) -> Option<WatchlistEntry> {
        let removed = self.state.lock().evict(stream_id, &self.services);
        if let Some(entry) = &removed {
            tracing::debug!(stream_id, item = entry.key.item_name(), "Unregistered stream");
        }
        removed
    }

    /// Copy of the entry for an identifier.
    #[must_use]
    pub fn lookup(&self, stream_id: StreamId) -> Option<WatchlistEntry> {
        self.state.lock().entries.get(&stream_id).cloned()
    }

    /// Identifier of the entry for a key.
    #[must_use]
    pub fn find(&self, key: &StreamKey) -> Option<StreamId> {
        let canonical = canonical_key(key, &self.services);
        self.state.lock().index.get(&canonical).copied()
    }

    /// Snapshot of every entry matching `predicate`, ordered by identifier.
    pub fn all_entries_needing(
        &self,
        predicate: impl Fn(&WatchlistEntry) -> bool,
    ) -> EntrySnapshot {
        let mut entries: Vec<WatchlistEntry> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| predicate(*e))
                .cloned()
                .collect()
        };
        entries.sort_by_key(WatchlistEntry::stream_id);

        EntrySnapshot {
            entries: entries.into(),
        }
    }

    /// Degrade every entry after the channel is lost.
    ///
    /// Open entries become `OpenSuspect`, and every recoverable entry is
    /// flagged for resend. Returns the number of entries flagged.
    pub fn degrade_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut flagged = 0;

        for entry in state.entries.values_mut() {
            if entry.state.is_open() {
                entry.state = StreamState::OpenSuspect;
            }
            if entry.state.is_recoverable() {
                entry.needs_resend = true;
                flagged += 1;
            }
        }

        flagged
    }

    /// Flag one entry for resend. Returns `false` if the entry is absent.
    pub fn mark_needs_resend(&self, stream_id: StreamId) -> bool {
        let mut state = self.state.lock();
        state.entries.get_mut(&stream_id).is_some_and(|entry| {
            entry.needs_resend = true;
            true
        })
    }

    /// Clear an entry's resend flag. Returns `false` if the entry is absent.
    pub fn clear_resend(&self, stream_id: StreamId) -> bool {
        let mut state = self.state.lock();
        state.entries.get_mut(&stream_id).is_some_and(|entry| {
            entry.needs_resend = false;
            true
        })
    }

    /// Claim an entry's pending resend.
    ///
    /// Clears the resend flag and reopens a recoverably-closed entry as
    /// `Pending`. Returns the entry to resend, or `None` if it is gone, not
    /// flagged, or `Closed`. Each flagged entry is claimed at most once.
    pub fn claim_resend(&self, stream_id: StreamId) -> Option<WatchlistEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&stream_id)?;

        if !entry.needs_resend || !entry.state.is_recoverable() {
            return None;
        }

        entry.needs_resend = false;
        if entry.state == StreamState::ClosedRecoverable {
            entry.state = StreamState::Pending;
        }

        Some(entry.clone())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the watchlist is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Entry counts by state.
    #[must_use]
    pub fn stats(&self) -> WatchlistStats {
        let state = self.state.lock();
        let mut stats = WatchlistStats {
            total: state.entries.len(),
            ..WatchlistStats::default()
        };

        for entry in state.entries.values() {
            match entry.state {
                StreamState::Pending => stats.pending += 1,
                StreamState::OpenOk => stats.open_ok += 1,
                StreamState::OpenSuspect => stats.open_suspect += 1,
                StreamState::Closed => stats.closed += 1,
                StreamState::ClosedRecoverable => stats.closed_recoverable += 1,
            }
            if entry.needs_resend {
                stats.awaiting_resend += 1;
            }
        }

        stats
    }
}

/// Key used for the reverse index, with the service resolved to an id when
/// the directory knows it.
fn canonical_key(key: &StreamKey, services: &HashMap<String, u16>) -> StreamKey {
    match key.service() {
        ServiceRef::Name(name) => services
            .get(name)
            .map_or_else(|| key.clone(), |&id| key.with_service(ServiceRef::Id(id))),
        ServiceRef::Id(_) => key.clone(),
    }
}

// =============================================================================
// Tests
// =============================================================================
