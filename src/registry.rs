use crate::{
    error::{ExchangeError, RegistryError},
    exchange::{ExchangeAdapter, StreamKind, StreamOptions},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// A registered stream leaf: the resolved capability plus the options passed on every
/// invocation, and any options a future consumer wiring step wants to see (`consumer_options`
/// is carried through but not interpreted by the core, same as the reference implementation's
/// `stream_consumer_options`).
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub kind: StreamKind,
    pub options: StreamOptions,
    pub consumer_options: StreamOptions,
}

#[derive(Debug, Default)]
struct SymbolEntry {
    streams: HashMap<String, StreamEntry>,
}

/// An exchange adapter shared between the Registry's map-management lock and any in-flight
/// `fetch`/`close` call. `RwLock` rather than `Mutex` because `fetch` takes `&self`: concurrent
/// producers reading different (or the same) stream should never block each other, only
/// `close_exchange`'s `&mut self` call needs exclusivity.
type SharedAdapter = Arc<RwLock<Box<dyn ExchangeAdapter>>>;

#[derive(Debug)]
struct ExchangeEntry {
    object: SharedAdapter,
    #[allow(dead_code)]
    overrides: StreamOptions,
    symbols: HashMap<String, SymbolEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    exchanges: HashMap<String, ExchangeEntry>,
}

/// Authoritative configuration store: which exchanges exist, which symbols are registered on
/// each, which streams are registered on each symbol, and the resolved fetch capability plus
/// options for each stream.
///
/// Map bookkeeping (insert/remove/lookup) serializes under a single [`tokio::sync::Mutex`], held
/// only across synchronous operations. Anything that suspends on the adapter itself — `fetch`,
/// `load_markets`, `close` — runs after that lock is released, against a cloned
/// [`SharedAdapter`] handle, so one producer's in-flight fetch never blocks another producer or
/// a concurrent registration.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exchange by name with the given adapter, already constructed with
    /// `overrides`. No-ops if already registered. On failure the partially-constructed adapter
    /// is dropped (via `close`, best-effort) before the error propagates.
    pub async fn register_exchange(
        &self,
        exchange: &str,
        mut object: Box<dyn ExchangeAdapter>,
        overrides: StreamOptions,
    ) -> Result<(), RegistryError> {
        if self.inner.lock().await.exchanges.contains_key(exchange) {
            info!(%exchange, "exchange already registered, skipping");
            return Ok(());
        }

        info!(%exchange, "registering exchange");
        if let Err(source) = object.load_markets().await {
            warn!(%exchange, %source, "failed to register exchange, releasing partially-constructed adapter");
            let _ = object.close().await;
            return Err(RegistryError::ExchangeInitError {
                exchange: exchange.to_owned(),
                source,
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.exchanges.contains_key(exchange) {
            // Lost a race against a concurrent `register_exchange` call for the same name while
            // `load_markets` was in flight. Discard this adapter rather than orphaning it.
            info!(%exchange, "exchange registered concurrently, discarding redundant adapter");
            let _ = object.close().await;
            return Ok(());
        }

        inner.exchanges.insert(
            exchange.to_owned(),
            ExchangeEntry {
                object: Arc::new(RwLock::new(object)),
                overrides,
                symbols: HashMap::new(),
            },
        );
        info!(%exchange, "exchange registered");
        Ok(())
    }

    /// Register a symbol under an already-registered exchange. No-ops if already registered.
    pub async fn register_symbol(&self, exchange: &str, symbol: &str) -> Result<(), RegistryError> {
        let object = {
            let inner = self.inner.lock().await;
            let entry = inner
                .exchanges
                .get(exchange)
                .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;

            if entry.symbols.contains_key(symbol) {
                info!(%exchange, %symbol, "symbol already registered, skipping");
                return Ok(());
            }

            Arc::clone(&entry.object)
        };

        if !object.read().await.symbols().contains(symbol) {
            return Err(RegistryError::InvalidSymbol {
                exchange: exchange.to_owned(),
                symbol: symbol.to_owned(),
            });
        }

        let mut inner = self.inner.lock().await;
        let entry = inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;
        if entry.symbols.contains_key(symbol) {
            info!(%exchange, %symbol, "symbol registered concurrently, skipping");
            return Ok(());
        }

        entry.symbols.insert(symbol.to_owned(), SymbolEntry::default());
        info!(%exchange, %symbol, "symbol registered");
        Ok(())
    }

    /// Register a stream under an already-registered exchange/symbol. No-ops if already
    /// registered. Validates `stream` against the adapter's capability map:
    /// absent -> [`RegistryError::UndefinedStream`],
    /// `Some(false)` -> [`RegistryError::StreamUnsupported`].
    pub async fn register_stream(
        &self,
        exchange: &str,
        symbol: &str,
        stream: StreamKind,
        options: StreamOptions,
        consumer_options: StreamOptions,
    ) -> Result<(), RegistryError> {
        let stream_name = stream.to_string();

        let object = {
            let inner = self.inner.lock().await;
            let entry = inner
                .exchanges
                .get(exchange)
                .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;
            let symbol_entry = entry
                .symbols
                .get(symbol)
                .ok_or_else(|| RegistryError::UnregisteredSymbol {
                    exchange: exchange.to_owned(),
                    symbol: symbol.to_owned(),
                })?;

            if symbol_entry.streams.contains_key(&stream_name) {
                info!(%exchange, %symbol, %stream_name, "stream already registered, skipping");
                return Ok(());
            }

            Arc::clone(&entry.object)
        };

        match object.read().await.has(&stream) {
            None => {
                return Err(RegistryError::UndefinedStream {
                    exchange: exchange.to_owned(),
                    stream: stream_name,
                })
            }
            Some(false) => {
                return Err(RegistryError::StreamUnsupported {
                    exchange: exchange.to_owned(),
                    stream: stream_name,
                })
            }
            Some(true) => {}
        }

        let mut inner = self.inner.lock().await;
        let symbol_entry = symbol_entry_mut(&mut inner, exchange, symbol)?;
        if symbol_entry.streams.contains_key(&stream_name) {
            info!(%exchange, %symbol, %stream_name, "stream registered concurrently, skipping");
            return Ok(());
        }

        symbol_entry.streams.insert(
            stream_name.clone(),
            StreamEntry {
                kind: stream,
                options,
                consumer_options,
            },
        );
        info!(%exchange, %symbol, %stream_name, "stream registered");
        Ok(())
    }

    /// Remove a stream leaf. Does not stop a running producer; the caller must coordinate.
    pub async fn unregister_stream(
        &self,
        exchange: &str,
        symbol: &str,
        stream: &str,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let symbol_entry = symbol_entry_mut(&mut inner, exchange, symbol)?;
        if symbol_entry.streams.remove(stream).is_none() {
            return Err(RegistryError::UnregisteredStream {
                exchange: exchange.to_owned(),
                symbol: symbol.to_owned(),
                stream: stream.to_owned(),
            });
        }
        info!(%exchange, %symbol, %stream, "stream unregistered");
        Ok(())
    }

    /// Remove a symbol. Fails with [`RegistryError::SymbolStillHasChildren`] if it has
    /// registered streams, unless `force` is set.
    pub async fn unregister_symbol(
        &self,
        exchange: &str,
        symbol: &str,
        force: bool,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;

        let symbol_entry = entry
            .symbols
            .get(symbol)
            .ok_or_else(|| RegistryError::UnregisteredSymbol {
                exchange: exchange.to_owned(),
                symbol: symbol.to_owned(),
            })?;

        if !symbol_entry.streams.is_empty() && !force {
            return Err(RegistryError::SymbolStillHasChildren {
                exchange: exchange.to_owned(),
                symbol: symbol.to_owned(),
            });
        }

        entry.symbols.remove(symbol);
        info!(%exchange, %symbol, force, "symbol unregistered");
        Ok(())
    }

    /// Remove an exchange. Fails with [`RegistryError::ExchangeStillHasChildren`] if it has
    /// registered symbols, unless `force` is set. Does not close the adapter handle — the
    /// Producer Pipeline owns that lifecycle.
    pub async fn unregister_exchange(&self, exchange: &str, force: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;

        if !entry.symbols.is_empty() && !force {
            return Err(RegistryError::ExchangeStillHasChildren(exchange.to_owned()));
        }

        inner.exchanges.remove(exchange);
        info!(%exchange, force, "exchange unregistered");
        Ok(())
    }

    pub async fn exchange_registered(&self, exchange: &str) -> bool {
        self.inner.lock().await.exchanges.contains_key(exchange)
    }

    pub async fn symbol_registered(&self, exchange: &str, symbol: &str) -> Result<bool, RegistryError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;
        Ok(entry.symbols.contains_key(symbol))
    }

    pub async fn stream_registered(
        &self,
        exchange: &str,
        symbol: &str,
        stream: &str,
    ) -> Result<bool, RegistryError> {
        let inner = self.inner.lock().await;
        let symbol_entry = symbol_entry_ref(&inner, exchange, symbol)?;
        Ok(symbol_entry.streams.contains_key(stream))
    }

    /// Whether any symbol on `exchange` has at least one registered stream.
    pub async fn has_registered_streams(&self, exchange: &str) -> Result<bool, RegistryError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;
        Ok(entry.symbols.values().any(|s| !s.streams.is_empty()))
    }

    pub async fn get_stream_options(
        &self,
        exchange: &str,
        symbol: &str,
        stream: &str,
    ) -> Result<StreamOptions, RegistryError> {
        let inner = self.inner.lock().await;
        let symbol_entry = symbol_entry_ref(&inner, exchange, symbol)?;
        symbol_entry
            .streams
            .get(stream)
            .map(|entry| entry.options.clone())
            .ok_or_else(|| RegistryError::UnregisteredStream {
                exchange: exchange.to_owned(),
                symbol: symbol.to_owned(),
                stream: stream.to_owned(),
            })
    }

    pub async fn get_stream_kind(
        &self,
        exchange: &str,
        symbol: &str,
        stream: &str,
    ) -> Result<StreamKind, RegistryError> {
        let inner = self.inner.lock().await;
        let symbol_entry = symbol_entry_ref(&inner, exchange, symbol)?;
        symbol_entry
            .streams
            .get(stream)
            .map(|entry| entry.kind.clone())
            .ok_or_else(|| RegistryError::UnregisteredStream {
                exchange: exchange.to_owned(),
                symbol: symbol.to_owned(),
                stream: stream.to_owned(),
            })
    }

    /// Every `(symbol, stream_name)` pair currently registered under `exchange`.
    pub async fn registered_triples(&self, exchange: &str) -> Result<Vec<(String, String)>, RegistryError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;

        Ok(entry
            .symbols
            .iter()
            .flat_map(|(symbol, symbol_entry)| {
                symbol_entry
                    .streams
                    .keys()
                    .map(move |stream| (symbol.clone(), stream.clone()))
            })
            .collect())
    }

    /// All exchange names currently registered.
    pub async fn exchange_names(&self) -> Vec<String> {
        self.inner.lock().await.exchanges.keys().cloned().collect()
    }

    /// Fetch `symbol`'s stream payload by delegating to the registered adapter's `fetch`.
    /// Exposed so [`DataProducer`](crate::producer::DataProducer) doesn't need to hold a
    /// reference to the adapter directly: the Registry remains the sole owner.
    pub async fn fetch(
        &self,
        exchange: &str,
        symbol: &str,
        stream: &str,
    ) -> Result<crate::message::Payload, FetchDispatchError> {
        let (object, kind, options) = {
            let inner = self.inner.lock().await;
            let entry = inner
                .exchanges
                .get(exchange)
                .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;
            let symbol_entry = entry
                .symbols
                .get(symbol)
                .ok_or_else(|| RegistryError::UnregisteredSymbol {
                    exchange: exchange.to_owned(),
                    symbol: symbol.to_owned(),
                })?;
            let stream_entry =
                symbol_entry
                    .streams
                    .get(stream)
                    .ok_or_else(|| RegistryError::UnregisteredStream {
                        exchange: exchange.to_owned(),
                        symbol: symbol.to_owned(),
                        stream: stream.to_owned(),
                    })?;

            (Arc::clone(&entry.object), stream_entry.kind.clone(), stream_entry.options.clone())
        };

        // Read, not write: `fetch` takes `&self`, so concurrent producers on the same exchange
        // (even the same stream) never block each other here. Held only across the adapter call,
        // never across the map lock above, so this can suspend indefinitely without blocking any
        // other Registry operation.
        let result = object
            .read()
            .await
            .fetch(&kind, symbol, &options)
            .await
            .map_err(FetchDispatchError::Fetch);
        result
    }

    /// Close an exchange's adapter handle. Used by the Producer Pipeline when the last producer
    /// referencing an exchange is removed. Errors are returned, not logged here, so the caller
    /// can apply the "log and swallow" policy at the right granularity.
    pub async fn close_exchange(&self, exchange: &str) -> Result<(), ExchangeError> {
        let object = {
            let inner = self.inner.lock().await;
            match inner.exchanges.get(exchange) {
                Some(entry) => Arc::clone(&entry.object),
                None => return Ok(()),
            }
        };
        let result = object.write().await.close().await;
        result
    }
}

/// Error returned by [`Registry::fetch`]: either the stream wasn't registered, or the adapter's
/// fetch method failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchDispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Fetch(#[from] crate::error::FetchError),
}

fn symbol_entry_mut<'a>(
    inner: &'a mut Inner,
    exchange: &str,
    symbol: &str,
) -> Result<&'a mut SymbolEntry, RegistryError> {
    let entry = inner
        .exchanges
        .get_mut(exchange)
        .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;
    entry
        .symbols
        .get_mut(symbol)
        .ok_or_else(|| RegistryError::UnregisteredSymbol {
            exchange: exchange.to_owned(),
            symbol: symbol.to_owned(),
        })
}

fn symbol_entry_ref<'a>(
    inner: &'a Inner,
    exchange: &str,
    symbol: &str,
) -> Result<&'a SymbolEntry, RegistryError> {
    let entry = inner
        .exchanges
        .get(exchange)
        .ok_or_else(|| RegistryError::UnregisteredExchange(exchange.to_owned()))?;
    entry
        .symbols
        .get(symbol)
        .ok_or_else(|| RegistryError::UnregisteredSymbol {
            exchange: exchange.to_owned(),
            symbol: symbol.to_owned(),
        })
}

/// Convenience alias used by [`crate::runner::PipelineRunner`] to share a Registry across tasks.
pub type SharedRegistry = Arc<Registry>;
