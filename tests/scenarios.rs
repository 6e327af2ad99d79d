//! End-to-end acceptance tests for the six scenarios and five quantified invariants, wired
//! through [`PipelineRunner`] and the public [`Registry`]/[`ProducerPipeline`]/
//! [`ConsumerPipeline`] API rather than any single module's internals.

use market_data_pipeline::config::Config;
use market_data_pipeline::consumer::{Consumer, ConsumerError};
use market_data_pipeline::exchange::{ExchangeAdapter, StreamKind};
use market_data_pipeline::message::Envelope;
use market_data_pipeline::producer::{DataProducer, ProducerStatus};
use market_data_pipeline::producer_pipeline::ProducerPipeline;
use market_data_pipeline::registry::Registry;
use market_data_pipeline::runner::{AdapterFactory, PipelineRunner};
use market_data_pipeline::test_util::{map_payload, RecordingConsumer, ScriptedFetch, StubExchange};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn base_config() -> serde_json::Value {
    json!({
        "consumers": {},
        "exchanges": {
            "binance": {
                "properties": {},
                "symbols": {
                    "BTC/USDT:USDT": {
                        "streams": {
                            "watchTicker": { "options": {} }
                        }
                    }
                }
            }
        }
    })
}

#[tokio::test]
async fn s1_and_s2_metadata_injection_end_to_end() {
    let mut adapter = StubExchange::new(["BTC/USDT:USDT"]);
    adapter.set_has(StreamKind::Ticker, Some(true));
    adapter.script(
        "BTC/USDT:USDT",
        &StreamKind::Ticker,
        vec![
            ScriptedFetch::Ok(map_payload(&[("bid", json!(100)), ("ask", json!(101))])),
            ScriptedFetch::Ok(market_data_pipeline::message::Payload::Seq(vec![json!([1, 2, 3, 4])])),
        ],
    );
    let adapter = Arc::new(adapter);

    let mut factories: HashMap<String, AdapterFactory> = HashMap::new();
    {
        let adapter = Arc::clone(&adapter);
        factories.insert(
            "binance".to_owned(),
            Box::new(move |_props| Box::new(Arc::clone(&adapter)) as Box<dyn ExchangeAdapter>),
        );
    }

    let recorder = Arc::new(RecordingEnvelopeConsumer::new("rec"));
    let runner = PipelineRunner::build(
        Config::from_value(base_config()).unwrap(),
        factories,
        vec![Arc::clone(&recorder) as Arc<dyn Consumer>],
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let envelopes = recorder.envelopes();
    assert_eq!(envelopes.len(), 2);

    // S1 — dict payload
    assert_eq!(envelopes[0].as_map().get("bid"), Some(&json!(100)));
    assert_eq!(envelopes[0].producer(), Some("binance|BTC/USDT:USDT|watchTicker"));

    // S2 — sequence payload wrapped under "data"
    assert_eq!(envelopes[1].as_map().get("data"), Some(&json!([[1, 2, 3, 4]])));
    assert_eq!(envelopes[1].producer(), Some("binance|BTC/USDT:USDT|watchTicker"));

    runner.shutdown().await;
}

#[tokio::test]
async fn s3_fan_out_delivers_every_message_to_every_consumer_in_order() {
    let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(market_data_pipeline::consumer_pipeline::ConsumerPipeline::new(ingress_rx));

    let a = Arc::new(RecordingEnvelopeConsumer::new("A"));
    let b = Arc::new(RecordingEnvelopeConsumer::new("B"));
    pipeline.add_consumer(Arc::clone(&a) as Arc<dyn Consumer>).await;
    pipeline.add_consumer(Arc::clone(&b) as Arc<dyn Consumer>).await;
    pipeline.start_delegator().await;

    for i in 0..3 {
        let envelope = market_data_pipeline::message::Payload::Map(
            [("i".to_owned(), json!(i))].into_iter().collect(),
        )
        .into_envelope("binance|BTC/USDT:USDT|watchTicker")
        .unwrap();
        ingress_tx.send(envelope).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;

    let a_seen: Vec<_> = a.envelopes().iter().map(|e| e.as_map().get("i").cloned()).collect();
    let b_seen: Vec<_> = b.envelopes().iter().map(|e| e.as_map().get("i").cloned()).collect();
    assert_eq!(a_seen, vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]);
    assert_eq!(a_seen, b_seen);

    pipeline.stop_all_consumers().await;
    pipeline.stop_delegator().await;
}

#[tokio::test]
async fn s4_backoff_and_escalation() {
    let mut adapter = StubExchange::new(["BTC/USDT"]);
    adapter.set_has(StreamKind::Ticker, Some(true));
    adapter.script(
        "BTC/USDT",
        &StreamKind::Ticker,
        vec![
            ScriptedFetch::Transient("timeout".into()),
            ScriptedFetch::Transient("timeout".into()),
            ScriptedFetch::Transient("timeout".into()),
            ScriptedFetch::Transient("timeout".into()),
        ],
    );

    let registry = Arc::new(Registry::new());
    registry
        .register_exchange("binance", Box::new(adapter), Default::default())
        .await
        .unwrap();
    registry.register_symbol("binance", "BTC/USDT").await.unwrap();
    registry
        .register_stream("binance", "BTC/USDT", StreamKind::Ticker, Default::default(), Default::default())
        .await
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let producer = DataProducer::new("binance", "BTC/USDT", "watchTicker", Arc::clone(&registry), tx);
    let state = producer.state();

    tokio::time::pause();
    let handle = tokio::spawn(producer.run());
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(10)).await;
    }
    handle.await.unwrap();

    let state = state.lock().await;
    assert_eq!(state.status, ProducerStatus::Errored);
    assert_eq!(state.tries, 4);
    // Invariant 5: backoff sequence is 1, 2, 4 seconds (uncapped doubling), no sleep after the
    // fourth failure — implicitly exercised by the bounded three `advance` calls above completing
    // the run.
}

#[tokio::test]
async fn s5_exchange_closes_only_after_last_producer_removed() {
    let mut adapter = StubExchange::new(["BTC/USD"]);
    adapter.set_has(StreamKind::Ticker, Some(true));
    adapter.set_has(StreamKind::Trades, Some(true));
    let adapter = Arc::new(adapter);

    let registry = Arc::new(Registry::new());
    registry
        .register_exchange("kraken", Box::new(Arc::clone(&adapter)), Default::default())
        .await
        .unwrap();
    registry.register_symbol("kraken", "BTC/USD").await.unwrap();
    registry
        .register_stream("kraken", "BTC/USD", StreamKind::Ticker, Default::default(), Default::default())
        .await
        .unwrap();
    registry
        .register_stream("kraken", "BTC/USD", StreamKind::Trades, Default::default(), Default::default())
        .await
        .unwrap();

    let pipeline = ProducerPipeline::new(Arc::clone(&registry));
    let (tx, _rx) = mpsc::unbounded_channel();
    let p1 = DataProducer::new("kraken", "BTC/USD", "watchTicker", Arc::clone(&registry), tx.clone());
    let p2 = DataProducer::new("kraken", "BTC/USD", "watchTrades", Arc::clone(&registry), tx);
    let id1 = p1.identity().clone();
    let id2 = p2.identity().clone();
    pipeline.add_producer("kraken", p1).await;
    pipeline.add_producer("kraken", p2).await;

    // Invariant 3: close calls never exceed successful registrations (one registration here).
    pipeline.remove_producer(&id1).await;
    assert_eq!(adapter.close_calls(), 0);
    pipeline.remove_producer(&id2).await;
    assert_eq!(adapter.close_calls(), 1);
}

#[tokio::test]
async fn s6_delegator_cancellation_drains_queued_messages() {
    let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(market_data_pipeline::consumer_pipeline::ConsumerPipeline::new(ingress_rx));

    let recorder = Arc::new(RecordingConsumer::new("rec"));
    pipeline.add_consumer(Arc::clone(&recorder) as Arc<dyn Consumer>).await;

    for tag in [1, 2, 3] {
        let envelope = market_data_pipeline::message::Payload::Map(
            [("tag".to_owned(), json!(tag))].into_iter().collect(),
        )
        .into_envelope("x|y|z")
        .unwrap();
        ingress_tx.send(envelope).unwrap();
    }

    pipeline.start_delegator().await;
    pipeline.stop_delegator().await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(recorder.seen_tags(), vec![1, 2, 3]);
    pipeline.stop_all_consumers().await;
}

#[tokio::test]
async fn invariant_4_removed_producer_stops_emitting() {
    let mut adapter = StubExchange::new(["BTC/USDT"]);
    adapter.set_has(StreamKind::Ticker, Some(true));
    adapter.script(
        "BTC/USDT",
        &StreamKind::Ticker,
        vec![ScriptedFetch::Ok(map_payload(&[("n", json!(1))]))],
    );

    let registry = Arc::new(Registry::new());
    registry
        .register_exchange("binance", Box::new(adapter), Default::default())
        .await
        .unwrap();
    registry.register_symbol("binance", "BTC/USDT").await.unwrap();
    registry
        .register_stream("binance", "BTC/USDT", StreamKind::Ticker, Default::default(), Default::default())
        .await
        .unwrap();

    let pipeline = ProducerPipeline::new(Arc::clone(&registry));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let producer = DataProducer::new("binance", "BTC/USDT", "watchTicker", Arc::clone(&registry), tx);
    let id = producer.identity().clone();
    pipeline.add_producer("binance", producer).await;

    let first = rx.recv().await.unwrap();
    assert_eq!(first.producer(), Some("binance|BTC/USDT|watchTicker"));

    pipeline.remove_producer(&id).await;

    // No further message with this producer's identity should ever appear: the channel has no
    // other writer, so a closed/empty recv confirms silence.
    assert!(rx.recv().await.is_none());
}

/// A [`Consumer`] that records full envelopes (not just a "tag" field), for scenarios that need
/// to inspect payload shape directly.
struct RecordingEnvelopeConsumer {
    name: String,
    envelopes: std::sync::Mutex<Vec<Envelope>>,
}

impl RecordingEnvelopeConsumer {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            envelopes: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Consumer for RecordingEnvelopeConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, message: Arc<Envelope>) -> Result<(), ConsumerError> {
        self.envelopes.lock().unwrap().push((*message).clone());
        Ok(())
    }
}
