use crate::{
    error::{ExchangeError, FetchError},
    message::Payload,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::{Debug, Display, Formatter};

/// A named category of exchange updates (eg/ `watchTicker`, `watchTrades`).
///
/// Statically-typed stand-in for the dynamic method-name dispatch of the reference
/// implementation (Design Notes §9): the Registry stores a `StreamKind`, not a bound method, and
/// [`ExchangeAdapter::fetch`] dispatches on it. `Other` keeps the set open so a Registry can
/// still validate exchange-specific stream names that have no dedicated variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Ticker,
    Ohlcv,
    Trades,
    OrderBook,
    Other(String),
}

impl From<&str> for StreamKind {
    /// Maps a configuration-file stream name onto a [`StreamKind`] variant, falling back to
    /// `Other` for anything not in the closed set — the Registry still validates `Other` names
    /// against the adapter's capability map exactly like the named variants.
    fn from(name: &str) -> Self {
        match name {
            "watchTicker" => StreamKind::Ticker,
            "watchOHLCV" => StreamKind::Ohlcv,
            "watchTrades" => StreamKind::Trades,
            "watchOrderBook" => StreamKind::OrderBook,
            other => StreamKind::Other(other.to_owned()),
        }
    }
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Ticker => write!(f, "watchTicker"),
            StreamKind::Ohlcv => write!(f, "watchOHLCV"),
            StreamKind::Trades => write!(f, "watchTrades"),
            StreamKind::OrderBook => write!(f, "watchOrderBook"),
            StreamKind::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Keyword-style arguments passed on every invocation of a stream's fetch method.
pub type StreamOptions = serde_json::Map<String, serde_json::Value>;

/// The capability surface the supervision core consumes from an exchange client library.
///
/// This is the §6 External Interface contract: out of scope for this crate to *implement*
/// (the real websocket plumbing lives in an exchange client library), but the Registry, Data
/// Producer, and Pipeline Runner are written entirely against this trait.
#[async_trait]
pub trait ExchangeAdapter: Debug + Send + Sync + 'static {
    /// Load/refresh the set of tradable symbols and capability map. Must be called, and must
    /// succeed, before any other method is invoked.
    async fn load_markets(&mut self) -> Result<(), ExchangeError>;

    /// The set of symbol strings this exchange supports, as of the last `load_markets` call.
    fn symbols(&self) -> &HashSet<String>;

    /// Whether `stream` is supported: `Some(true)` implemented & supported, `Some(false)`
    /// explicitly unsupported, `None` undefined/unknown to this exchange.
    fn has(&self, stream: &StreamKind) -> Option<bool>;

    /// Idempotently release any resources (eg/ websocket connections) held by this adapter.
    async fn close(&mut self) -> Result<(), ExchangeError>;

    /// Fetch the next payload for `stream` on `symbol`, suspending until one is available.
    async fn fetch(
        &self,
        stream: &StreamKind,
        symbol: &str,
        options: &StreamOptions,
    ) -> Result<Payload, FetchError>;
}
