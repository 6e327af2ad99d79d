//! Configuration schema and validation, grounded in the reference implementation's
//! `helpers.py::valid_config`.

use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One stream's configuration leaf: the keyword options passed on every fetch invocation.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub options: Map<String, Value>,
}

/// One symbol's configuration subtree: its registered streams.
#[derive(Debug, Clone, Default)]
pub struct SymbolConfig {
    pub streams: HashMap<String, StreamConfig>,
}

/// One exchange's configuration subtree: initialization overrides plus its registered symbols.
#[derive(Debug, Clone, Default)]
pub struct ExchangeConfig {
    pub properties: Map<String, Value>,
    pub symbols: HashMap<String, SymbolConfig>,
}

/// Parsed, validated top-level configuration.
///
/// `consumers` is carried through unvalidated beyond "is a mapping" — the core never interprets
/// it; consumer instances are supplied directly to the [`PipelineRunner`](crate::runner::PipelineRunner).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub consumers: Value,
    pub exchanges: HashMap<String, ExchangeConfig>,
}

impl Config {
    /// Parse and validate a raw JSON configuration document. Fails before any network I/O.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let top = value.as_object().ok_or(ConfigError::ExchangesNotAMap)?;

        let consumers = top
            .get("consumers")
            .cloned()
            .ok_or(ConfigError::MissingTopLevelKey("consumers"))?;
        if !consumers.is_object() {
            return Err(ConfigError::ConsumersNotAMap);
        }

        let raw_exchanges = top
            .get("exchanges")
            .ok_or(ConfigError::MissingTopLevelKey("exchanges"))?
            .as_object()
            .ok_or(ConfigError::ExchangesNotAMap)?;

        let mut exchanges = HashMap::new();
        for (exchange_name, exchange_value) in raw_exchanges {
            exchanges.insert(exchange_name.clone(), parse_exchange(exchange_name, exchange_value)?);
        }

        Ok(Self { consumers, exchanges })
    }
}

fn parse_exchange(exchange: &str, value: &Value) -> Result<ExchangeConfig, ConfigError> {
    let raw = value.as_object();

    let properties = raw
        .and_then(|map| map.get("properties"))
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::PropertiesNotAMap { exchange: exchange.to_owned() })?
        .clone();

    let raw_symbols = raw
        .and_then(|map| map.get("symbols"))
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::SymbolsNotAMap { exchange: exchange.to_owned() })?;

    let mut symbols = HashMap::new();
    for (symbol_name, symbol_value) in raw_symbols {
        symbols.insert(symbol_name.clone(), parse_symbol(exchange, symbol_name, symbol_value)?);
    }

    Ok(ExchangeConfig { properties, symbols })
}

fn parse_symbol(exchange: &str, symbol: &str, value: &Value) -> Result<SymbolConfig, ConfigError> {
    let not_a_map = || ConfigError::StreamsNotAMap {
        exchange: exchange.to_owned(),
        symbol: symbol.to_owned(),
    };

    let raw_streams = value
        .as_object()
        .and_then(|map| map.get("streams"))
        .and_then(Value::as_object)
        .ok_or_else(not_a_map)?;

    let mut streams = HashMap::new();
    for (stream_name, stream_value) in raw_streams {
        streams.insert(stream_name.clone(), parse_stream(exchange, symbol, stream_name, stream_value)?);
    }

    Ok(SymbolConfig { streams })
}

fn parse_stream(exchange: &str, symbol: &str, stream: &str, value: &Value) -> Result<StreamConfig, ConfigError> {
    let not_a_map = || ConfigError::OptionsNotAMap {
        exchange: exchange.to_owned(),
        symbol: symbol.to_owned(),
        stream: stream.to_owned(),
    };

    let options = value
        .as_object()
        .and_then(|map| map.get("options"))
        .and_then(Value::as_object)
        .ok_or_else(not_a_map)?
        .clone();

    Ok(StreamConfig { options })
}
