//! Stream Identity and Delivery State
//!
//! Value types describing a logical subscription and the states its stream
//! moves through as refresh, update and status messages arrive.
//!
//! # Identity
//!
//! A [`StreamKey`] is the application-level name of a subscription: the
//! message domain, the item name, the service it is requested from, and
//! whether it is a private stream. The wire protocol never carries the key
//! after the initial request; it refers to the stream by a compact
//! [`StreamId`] allocated by the watchlist.
//!
//! # States
//!
//! Inbound messages carry a wire-level [`WireStreamState`] and [`DataState`].
//! These are folded into the entry-level [`StreamState`] by
//! [`StreamState::apply`].

use std::fmt;

use thiserror::Error;

// =============================================================================
// Types
// =============================================================================

/// Wire-level stream identifier.
pub type StreamId = i64;

/// Stream identifiers reserved for login, directory and dictionary streams.
pub const RESERVED_STREAM_IDS: StreamId = 4;

/// Largest identifier representable on the wire.
pub const MAX_STREAM_ID: StreamId = 2_147_483_647;

// =============================================================================
// Errors
// =============================================================================

/// Reasons a [`StreamKey`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamKeyError {
    /// The item name is empty.
    #[error("item name cannot be empty")]
    EmptyItemName,

    /// The raw domain code is not a known message domain.
    #[error("unrecognized domain type: {0}")]
    UnknownDomain(u8),

    /// The domain is served by a reserved administrative stream.
    #[error("domain {0} is reserved for administrative streams")]
    ReservedDomain(DomainType),
}

// =============================================================================
// Domain Type
// =============================================================================

/// Message-schema class of a subscription.
///
/// Discriminants are the on-wire domain codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DomainType {
    /// Session login.
    Login = 1,
    /// Service directory.
    Source = 4,
    /// Field dictionary download.
    Dictionary = 5,
    /// Level 1 quotes and trades.
    MarketPrice = 6,
    /// Full order book.
    MarketByOrder = 7,
    /// Aggregated price-level book.
    MarketByPrice = 8,
    /// Market maker quotes.
    MarketMaker = 9,
    /// List of item names.
    SymbolList = 10,
    /// Service provider status.
    ServiceProviderStatus = 11,
    /// Historical data.
    History = 12,
    /// News headlines.
    Headline = 13,
    /// News stories.
    Story = 14,
    /// Replayed headlines.
    ReplayHeadline = 15,
    /// Replayed stories.
    ReplayStory = 16,
    /// Transactions.
    Transaction = 17,
    /// Yield curves.
    YieldCurve = 22,
    /// Contributed data.
    Contribution = 27,
    /// Provider administration.
    ProviderAdmin = 29,
    /// Analytics.
    Analytics = 30,
    /// Reference data.
    Reference = 31,
    /// News text analytics.
    NewsTextAnalytics = 33,
    /// Economic indicators.
    EconomicIndicator = 34,
    /// Polls.
    Poll = 35,
    /// Forecasts.
    Forecast = 36,
    /// Time-ordered book.
    MarketByTime = 37,
    /// System domain.
    System = 127,
}

impl DomainType {
    /// On-wire domain code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether the domain is carried by one of the reserved streams.
    #[must_use]
    pub const fn is_administrative(self) -> bool {
        matches!(self, Self::Login | Self::Source | Self::Dictionary)
    }

    /// Short name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Source => "source",
            Self::Dictionary => "dictionary",
            Self::MarketPrice => "market_price",
            Self::MarketByOrder => "market_by_order",
            Self::MarketByPrice => "market_by_price",
            Self::MarketMaker => "market_maker",
            Self::SymbolList => "symbol_list",
            Self::ServiceProviderStatus => "service_provider_status",
            Self::History => "history",
            Self::Headline => "headline",
            Self::Story => "story",
            Self::ReplayHeadline => "replay_headline",
            Self::ReplayStory => "replay_story",
            Self::Transaction => "transaction",
            Self::YieldCurve => "yield_curve",
            Self::Contribution => "contribution",
            Self::ProviderAdmin => "provider_admin",
            Self::Analytics => "analytics",
            Self::Reference => "reference",
            Self::NewsTextAnalytics => "news_text_analytics",
            Self::EconomicIndicator => "economic_indicator",
            Self::Poll => "poll",
            Self::Forecast => "forecast",
            Self::MarketByTime => "market_by_time",
            Self::System => "system",
        }
    }
}

impl TryFrom<u8> for DomainType {
    type Error = StreamKeyError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let domain = match code {
            1 => Self::Login,
            4 => Self::Source,
            5 => Self::Dictionary,
            6 => Self::MarketPrice,
            7 => Self::MarketByOrder,
            8 => Self::MarketByPrice,
            9 => Self::MarketMaker,
            10 => Self::SymbolList,
            11 => Self::ServiceProviderStatus,
            12 => Self::History,
            13 => Self::Headline,
            14 => Self::Story,
            15 => Self::ReplayHeadline,
            16 => Self::ReplayStory,
            17 => Self::Transaction,
            22 => Self::YieldCurve,
            27 => Self::Contribution,
            29 => Self::ProviderAdmin,
            30 => Self::Analytics,
            31 => Self::Reference,
            33 => Self::NewsTextAnalytics,
            34 => Self::EconomicIndicator,
            35 => Self::Poll,
            36 => Self::Forecast,
            37 => Self::MarketByTime,
            127 => Self::System,
            other => return Err(StreamKeyError::UnknownDomain(other)),
        };
        Ok(domain)
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Service Reference
// =============================================================================

/// Service a subscription is requested from.
///
/// A service named in a request and the same service referred to by its
/// numeric id are different identities unless the watchlist was given a
/// directory that resolves the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceRef {
    /// Service by name.
    Name(String),
    /// Service by numeric id.
    Id(u16),
}

impl ServiceRef {
    /// Service referenced by name.
    #[must_use]
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Service referenced by id.
    #[must_use]
    pub const fn id(id: u16) -> Self {
        Self::Id(id)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Id(id) => write!(f, "#{id}"),
        }
    }
}

// =============================================================================
// Stream Key
// =============================================================================

/// Immutable identity of a logical subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    domain: DomainType,
    item_name: String,
    service: ServiceRef,
    private_stream: bool,
}

impl StreamKey {
    /// Create a key for a shared (non-private) stream.
    #[must_use]
    pub fn new(domain: DomainType, item_name: impl Into<String>, service: ServiceRef) -> Self {
        Self {
            domain,
            item_name: item_name.into(),
            service,
            private_stream: false,
        }
    }

    /// Create a key from a raw on-wire domain code.
    ///
    /// # Errors
    ///
    /// Returns [`StreamKeyError::UnknownDomain`] if the code is not a known domain.
    pub fn from_raw_domain(
        domain: u8,
        item_name: impl Into<String>,
        service: ServiceRef,
    ) -> Result<Self, StreamKeyError> {
        Ok(Self::new(DomainType::try_from(domain)?, item_name, service))
    }

    /// Same key with the private-stream flag set as given.
    #[must_use]
    pub fn with_private_stream(mut self, private_stream: bool) -> Self {
        self.private_stream = private_stream;
        self
    }

    /// Message domain.
    #[must_use]
    pub const fn domain(&self) -> DomainType {
        self.domain
    }

    /// Item name.
    #[must_use]
    pub fn item_name(&self) -> &str {
        &self.item_name
    }

    /// Service reference.
    #[must_use]
    pub const fn service(&self) -> &ServiceRef {
        &self.service
    }

    /// Whether this is a private stream.
    #[must_use]
    pub const fn is_private_stream(&self) -> bool {
        self.private_stream
    }

    /// Check the key can be subscribed on an item stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the item name is empty or the domain is one of
    /// the administrative domains served by reserved streams.
    pub fn validate(&self) -> Result<(), StreamKeyError> {
        if self.item_name.is_empty() {
            return Err(StreamKeyError::EmptyItemName);
        }
        if self.domain.is_administrative() {
            return Err(StreamKeyError::ReservedDomain(self.domain));
        }
        Ok(())
    }

    /// Same key with its service replaced.
    pub(crate) fn with_service(&self, service: ServiceRef) -> Self {
        Self {
            service,
            ..self.clone()
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.domain, self.item_name, self.service)?;
        if self.private_stream {
            f.write_str(" (private)")?;
        }
        Ok(())
    }
}

// =============================================================================
// View
// =============================================================================

/// Subset of the payload requested for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ViewSpec {
    /// Field identifiers from the field dictionary.
    FieldIds(Vec<i16>),
    /// Element names.
    ElementNames(Vec<String>),
}

// =============================================================================
// Wire States
// =============================================================================

/// Stream state carried by refresh and status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireStreamState {
    /// Stream is open and will receive updates.
    Open,
    /// Snapshot-only stream; closes after the final refresh.
    NonStreaming,
    /// Closed by the provider; the consumer may request it again.
    ClosedRecover,
    /// Closed by the provider; do not request again.
    Closed,
    /// Item moved to a different name or service.
    Redirected,
}

/// Data state carried by refresh and status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataState {
    /// Data state is unchanged from the previous message.
    NoChange,
    /// Data is good.
    Ok,
    /// Data may be stale.
    Suspect,
}

/// Kind of inbound message that carried a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    /// Full snapshot.
    Refresh,
    /// Stream health change.
    Status,
}

/// Inbound refresh or status notification for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEvent {
    /// Stream the message arrived on.
    pub stream_id: StreamId,
    /// Message kind.
    pub kind: StreamEventKind,
    /// Wire stream state.
    pub stream_state: WireStreamState,
    /// Wire data state.
    pub data_state: DataState,
    /// Whether this is the last message for the stream (complete snapshot
    /// on a non-streaming request, or a final close).
    pub is_final: bool,
}

impl StreamEvent {
    /// Refresh message.
    #[must_use]
    pub const fn refresh(
        stream_id: StreamId,
        stream_state: WireStreamState,
        data_state: DataState,
        is_final: bool,
    ) -> Self {
        Self {
            stream_id,
            kind: StreamEventKind::Refresh,
            stream_state,
            data_state,
            is_final,
        }
    }

    /// Status message.
    #[must_use]
    pub const fn status(
        stream_id: StreamId,
        stream_state: WireStreamState,
        data_state: DataState,
        is_final: bool,
    ) -> Self {
        Self {
            stream_id,
            kind: StreamEventKind::Status,
            stream_state,
            data_state,
            is_final,
        }
    }
}

// =============================================================================
// Entry State
// =============================================================================

/// Delivery state of a watchlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamState {
    /// Request sent, no refresh or status received yet.
    #[default]
    Pending,
    /// Open with good data.
    OpenOk,
    /// Open but data may be stale.
    OpenSuspect,
    /// Terminal; no further traffic expected.
    Closed,
    /// Closed by the provider; may be requested again.
    ClosedRecoverable,
}

impl StreamState {
    /// All entry states.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Pending,
            Self::OpenOk,
            Self::OpenSuspect,
            Self::Closed,
            Self::ClosedRecoverable,
        ]
    }

    /// Whether the state is `Closed` or `ClosedRecoverable`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::ClosedRecoverable)
    }

    /// Whether the stream still holds its identifier against reuse.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::OpenOk | Self::OpenSuspect)
    }

    /// Whether the stream is open (with good or suspect data).
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::OpenOk | Self::OpenSuspect)
    }

    /// Whether a request for this entry is reissued on recovery.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Fold a wire stream/data state pair into the next entry state.
    #[must_use]
    pub const fn apply(self, stream_state: WireStreamState, data_state: DataState) -> Self {
        match stream_state {
            WireStreamState::Open | WireStreamState::NonStreaming => match data_state {
                DataState::Ok => Self::OpenOk,
                DataState::Suspect => Self::OpenSuspect,
                DataState::NoChange => self,
            },
            WireStreamState::ClosedRecover => Self::ClosedRecoverable,
            WireStreamState::Closed | WireStreamState::Redirected => Self::Closed,
        }
    }

    /// Short name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OpenOk => "open_ok",
            Self::OpenSuspect => "open_suspect",
            Self::Closed => "closed",
            Self::ClosedRecoverable => "closed_recoverable",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn ibm() -> StreamKey {
        StreamKey::new(DomainType::MarketPrice, "IBM.N", ServiceRef::name("DIRECT_FEED"))
    }

    #[test]
    fn domain_round_trips_through_code() {
        for code in 0..=u8::MAX {
            if let Ok(domain) = DomainType::try_from(code) {
                assert_eq!(domain.code(), code);
            }
        }
    }

    #[test]
    fn unknown_domain_code_rejected() {
        assert_eq!(
            DomainType::try_from(2),
            Err(StreamKeyError::UnknownDomain(2))
        );
        assert!(StreamKey::from_raw_domain(200, "IBM.N", ServiceRef::id(1)).is_err());
    }

    #[test]
    fn administrative_domains() {
        assert!(DomainType::Login.is_administrative());
        assert!(DomainType::Source.is_administrative());
        assert!(DomainType::Dictionary.is_administrative());
        assert!(!DomainType::MarketPrice.is_administrative());
        assert!(!DomainType::MarketByOrder.is_administrative());
    }

    #[test]
    fn key_equality_covers_every_field() {
        let key = ibm();
        assert_eq!(key, ibm());
        assert_ne!(key, ibm().with_private_stream(true));
        assert_ne!(
            key,
            StreamKey::new(DomainType::MarketByPrice, "IBM.N", ServiceRef::name("DIRECT_FEED"))
        );
        assert_ne!(
            key,
            StreamKey::new(DomainType::MarketPrice, "IBM.N", ServiceRef::id(1))
        );
    }

    #[test]
    fn validate_rejects_empty_item() {
        let key = StreamKey::new(DomainType::MarketPrice, "", ServiceRef::id(1));
        assert_eq!(key.validate(), Err(StreamKeyError::EmptyItemName));
    }

    #[test]
    fn validate_rejects_admin_domain() {
        let key = StreamKey::new(DomainType::Login, "user", ServiceRef::id(1));
        assert_eq!(
            key.validate(),
            Err(StreamKeyError::ReservedDomain(DomainType::Login))
        );
    }

    #[test]
    fn key_display() {
        assert_eq!(ibm().to_string(), "market_price:IBM.N@DIRECT_FEED");
        let private = StreamKey::new(DomainType::MarketByOrder, "TRI.N", ServiceRef::id(257))
            .with_private_stream(true);
        assert_eq!(private.to_string(), "market_by_order:TRI.N@#257 (private)");
    }

    #[test_case(StreamState::Pending, WireStreamState::Open, DataState::Ok => StreamState::OpenOk)]
    #[test_case(StreamState::Pending, WireStreamState::Open, DataState::Suspect => StreamState::OpenSuspect)]
    #[test_case(StreamState::Pending, WireStreamState::Open, DataState::NoChange => StreamState::Pending)]
    #[test_case(StreamState::OpenSuspect, WireStreamState::Open, DataState::Ok => StreamState::OpenOk)]
    #[test_case(StreamState::OpenOk, WireStreamState::Open, DataState::NoChange => StreamState::OpenOk)]
    #[test_case(StreamState::OpenOk, WireStreamState::NonStreaming, DataState::Ok => StreamState::OpenOk)]
    #[test_case(StreamState::OpenOk, WireStreamState::ClosedRecover, DataState::Suspect => StreamState::ClosedRecoverable)]
    #[test_case(StreamState::OpenOk, WireStreamState::Closed, DataState::Ok => StreamState::Closed)]
    #[test_case(StreamState::Pending, WireStreamState::Redirected, DataState::Suspect => StreamState::Closed)]
    fn state_mapping(from: StreamState, wire: WireStreamState, data: DataState) -> StreamState {
        from.apply(wire, data)
    }

    #[test]
    fn state_classification() {
        for state in StreamState::all() {
            assert_ne!(state.is_live(), state.is_terminal());
        }
        assert!(StreamState::ClosedRecoverable.is_recoverable());
        assert!(!StreamState::Closed.is_recoverable());
        assert!(StreamState::OpenSuspect.is_open());
        assert!(!StreamState::Pending.is_open());
    }
}
