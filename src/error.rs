use thiserror::Error;

/// Errors surfaced while mutating or querying a [`Registry`](crate::registry::Registry).
///
/// Mirrors the exception taxonomy of the reference `crypto_data_collector.registry` module,
/// with the `has` capability check split into three explicit outcomes instead of the
/// original's `is None or False` identity check.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("exchange '{0}' is not registered")]
    UnregisteredExchange(String),

    #[error("symbol '{symbol}' is not registered for exchange '{exchange}'")]
    UnregisteredSymbol { exchange: String, symbol: String },

    #[error("stream '{stream}' for symbol '{symbol}' is not registered for exchange '{exchange}'")]
    UnregisteredStream {
        exchange: String,
        symbol: String,
        stream: String,
    },

    #[error("'{symbol}' is not a valid symbol for exchange '{exchange}'")]
    InvalidSymbol { exchange: String, symbol: String },

    #[error("stream '{stream}' is undefined on exchange '{exchange}' (check spelling)")]
    UndefinedStream { exchange: String, stream: String },

    /// Named by the surfaced error taxonomy for parity with the reference registry, where a
    /// capability map can hold an explicit `null` distinct from a missing key. `ExchangeAdapter::has`
    /// returns `Option<bool>`, which cannot represent that third state, so this variant is never
    /// constructed by [`Registry::register_stream`](crate::registry::Registry::register_stream)
    /// today; an adapter wrapping a dynamically-discovered capability map could still raise it from
    /// a custom `has` implementation that distinguishes "known but unimplemented" some other way.
    #[error("stream '{stream}' is not yet implemented on exchange '{exchange}'")]
    StreamNotImplemented { exchange: String, stream: String },

    #[error("stream '{stream}' is unsupported on exchange '{exchange}'")]
    StreamUnsupported { exchange: String, stream: String },

    #[error("failed to initialise exchange '{exchange}': {source}")]
    ExchangeInitError {
        exchange: String,
        #[source]
        source: ExchangeError,
    },

    #[error("exchange '{0}' still has symbols registered; pass force=true to override")]
    ExchangeStillHasChildren(String),

    #[error("symbol '{symbol}' on exchange '{exchange}' still has streams registered; pass force=true to override")]
    SymbolStillHasChildren { exchange: String, symbol: String },
}

/// Errors an [`ExchangeAdapter`](crate::exchange::ExchangeAdapter) implementation may raise.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange construction failed: {0}")]
    Construction(String),

    #[error("load_markets failed: {0}")]
    LoadMarkets(String),

    #[error("close failed: {0}")]
    Close(String),
}

/// Errors raised by an [`ExchangeAdapter`] fetch method, classified so the
/// [`DataProducer`](crate::producer::DataProducer) run loop can decide between backoff-retry and
/// immediate termination.
#[derive(Debug, Error)]
pub enum FetchError {
    /// A transient failure (timeouts, operation-failed, connection reset). Retried with
    /// exponential backoff up to `max_tries`.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Any other failure. Terminates the producer immediately without retry.
    #[error("fatal exchange error: {0}")]
    Fatal(String),
}

/// Errors raised while validating a [`Config`](crate::config::Config) before any network I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing top-level key: '{0}'")]
    MissingTopLevelKey(&'static str),

    #[error("'consumers' must be a mapping")]
    ConsumersNotAMap,

    #[error("'exchanges' must be a mapping")]
    ExchangesNotAMap,

    #[error("'exchanges.{exchange}.properties' must be a mapping")]
    PropertiesNotAMap { exchange: String },

    #[error("'exchanges.{exchange}.symbols' must be a mapping")]
    SymbolsNotAMap { exchange: String },

    #[error("'exchanges.{exchange}.symbols.{symbol}.streams' must be a mapping")]
    StreamsNotAMap { exchange: String, symbol: String },

    #[error("'exchanges.{exchange}.symbols.{symbol}.streams.{stream}.options' must be a mapping")]
    OptionsNotAMap {
        exchange: String,
        symbol: String,
        stream: String,
    },
}
