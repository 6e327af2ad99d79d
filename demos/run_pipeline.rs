//! Illustrative wiring, mirroring the reference implementation's `__main__.py`: build a
//! configuration, register a stub exchange factory, attach a logging consumer, run until
//! Ctrl-C, then tear down.
//!
//! `cargo run --example run_pipeline`

use async_trait::async_trait;
use market_data_pipeline::{Consumer, ConsumerError, Envelope, ExchangeAdapter, PipelineRunner};
use market_data_pipeline::config::Config;
use market_data_pipeline::error::{ExchangeError, FetchError};
use market_data_pipeline::exchange::{StreamKind, StreamOptions};
use market_data_pipeline::message::Payload;
use market_data_pipeline::shutdown::shutdown_channel;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// The consumer the reference implementation's `ExampleConsumer` stood in for: do something with
/// the data. Here it just logs.
struct LoggingConsumer {
    name: String,
}

#[async_trait]
impl Consumer for LoggingConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, message: Arc<Envelope>) -> Result<(), ConsumerError> {
        info!(consumer = %self.name, envelope = ?message.as_map(), "received message");
        Ok(())
    }
}

/// A toy adapter standing in for a real exchange client library, ticking out a synthetic ticker
/// payload on every fetch.
#[derive(Debug)]
struct ToyExchange {
    symbols: HashSet<String>,
}

#[async_trait]
impl ExchangeAdapter for ToyExchange {
    async fn load_markets(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }

    fn symbols(&self) -> &HashSet<String> {
        &self.symbols
    }

    fn has(&self, stream: &StreamKind) -> Option<bool> {
        match stream {
            StreamKind::Ticker => Some(true),
            _ => Some(false),
        }
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn fetch(
        &self,
        _stream: &StreamKind,
        _symbol: &str,
        _options: &StreamOptions,
    ) -> Result<Payload, FetchError> {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let mut map = Map::new();
        map.insert("bid".to_owned(), json!(100));
        map.insert("ask".to_owned(), json!(101));
        Ok(Payload::Map(map))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    info!("market data pipeline demo startup");

    let config = Config::from_value(json!({
        "consumers": {},
        "exchanges": {
            "toyexchange": {
                "properties": {},
                "symbols": {
                    "BTC/USD": {
                        "streams": {
                            "watchTicker": { "options": {} }
                        }
                    }
                }
            }
        }
    }))
    .expect("demo config is well-formed");

    let mut factories: std::collections::HashMap<String, market_data_pipeline::runner::AdapterFactory> =
        std::collections::HashMap::new();
    factories.insert(
        "toyexchange".to_owned(),
        Box::new(|_properties: &Map<String, Value>| {
            Box::new(ToyExchange {
                symbols: ["BTC/USD".to_owned()].into_iter().collect(),
            }) as Box<dyn ExchangeAdapter>
        }),
    );

    let consumer = Arc::new(LoggingConsumer { name: "logger".to_owned() });
    let runner = PipelineRunner::build(config, factories, vec![consumer])
        .await
        .expect("pipeline wiring succeeds");

    let (mut notifier, listener) = shutdown_channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        notifier.send();
    });

    runner.run_until_shutdown(listener).await;
    info!("market data pipeline demo shutdown complete");
}
