//! Stub [`ExchangeAdapter`] used by this crate's own unit and integration tests. Not feature
//! gated so `tests/*.rs` can reuse it directly; not intended as a public testing API.

use crate::{
    error::{ExchangeError, FetchError},
    exchange::{ExchangeAdapter, StreamKind, StreamOptions},
    message::Payload,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Scripted fetch outcome for [`StubExchange`].
#[derive(Debug, Clone)]
pub enum ScriptedFetch {
    Ok(Payload),
    Transient(String),
    Fatal(String),
}

#[derive(Debug, Default)]
struct StubState {
    fetch_script: HashMap<String, VecDeque<ScriptedFetch>>,
    close_calls: u32,
}

/// A fully in-memory [`ExchangeAdapter`] for exercising the Registry, Data Producer, and
/// pipelines without any real network I/O.
#[derive(Debug)]
pub struct StubExchange {
    symbols: HashSet<String>,
    has: HashMap<StreamKind, Option<bool>>,
    fail_load_markets: bool,
    state: Mutex<StubState>,
}

impl StubExchange {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            has: HashMap::new(),
            fail_load_markets: false,
            state: Mutex::new(StubState::default()),
        }
    }

    pub fn set_has(&mut self, stream: StreamKind, support: Option<bool>) {
        self.has.insert(stream, support);
    }

    pub fn fail_load_markets(&mut self) {
        self.fail_load_markets = true;
    }

    /// Queue outcomes returned in order by successive `fetch` calls for `(symbol, stream)`.
    pub fn script<S: Into<String>>(&self, symbol: S, stream: &StreamKind, outcomes: Vec<ScriptedFetch>) {
        let key = format!("{}|{}", symbol.into(), stream);
        self.state
            .lock()
            .unwrap()
            .fetch_script
            .insert(key, outcomes.into());
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().unwrap().close_calls
    }

    /// Record a close, usable from behind a shared reference (eg/ an `Arc<StubExchange>` wrapped
    /// by a test-local forwarding adapter whose own `&mut self` doesn't reach through the `Arc`).
    pub fn record_close(&self) {
        self.state.lock().unwrap().close_calls += 1;
    }
}

#[async_trait]
impl ExchangeAdapter for StubExchange {
    async fn load_markets(&mut self) -> Result<(), ExchangeError> {
        if self.fail_load_markets {
            return Err(ExchangeError::LoadMarkets("stubbed failure".into()));
        }
        Ok(())
    }

    fn symbols(&self) -> &HashSet<String> {
        &self.symbols
    }

    fn has(&self, stream: &StreamKind) -> Option<bool> {
        self.has.get(stream).copied().flatten()
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        self.state.lock().unwrap().close_calls += 1;
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &StreamKind,
        symbol: &str,
        _options: &StreamOptions,
    ) -> Result<Payload, FetchError> {
        let key = format!("{symbol}|{stream}");
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.fetch_script.entry(key).or_default().pop_front()
        };

        match outcome {
            Some(ScriptedFetch::Ok(payload)) => Ok(payload),
            Some(ScriptedFetch::Transient(msg)) => Err(FetchError::Transient(msg)),
            Some(ScriptedFetch::Fatal(msg)) => Err(FetchError::Fatal(msg)),
            // An exhausted script means "no new data yet" — pend forever so callers observe the
            // same suspend-until-cancelled behavior a real websocket fetch would exhibit, rather
            // than spinning the caller's loop.
            None => std::future::pending().await,
        }
    }
}

/// Lets a test keep an `Arc<StubExchange>` handle (to script fetches or assert `close_calls`)
/// after handing a `Box<dyn ExchangeAdapter>` clone of it to a [`Registry`](crate::registry::Registry).
/// `load_markets`/`close` only need shared access since all of [`StubExchange`]'s state is
/// interior-mutable.
#[async_trait]
impl ExchangeAdapter for Arc<StubExchange> {
    async fn load_markets(&mut self) -> Result<(), ExchangeError> {
        if self.fail_load_markets {
            return Err(ExchangeError::LoadMarkets("stubbed failure".into()));
        }
        Ok(())
    }

    fn symbols(&self) -> &HashSet<String> {
        <StubExchange as ExchangeAdapter>::symbols(self.as_ref())
    }

    fn has(&self, stream: &StreamKind) -> Option<bool> {
        <StubExchange as ExchangeAdapter>::has(self.as_ref(), stream)
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        self.record_close();
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &StreamKind,
        symbol: &str,
        options: &StreamOptions,
    ) -> Result<Payload, FetchError> {
        <StubExchange as ExchangeAdapter>::fetch(self.as_ref(), stream, symbol, options).await
    }
}

/// Build a `Map` payload from `key, value` pairs — convenience for test bodies.
pub fn map_payload(pairs: &[(&str, Value)]) -> Payload {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_owned(), v.clone());
    }
    Payload::Map(map)
}

/// A [`Consumer`](crate::consumer::Consumer) that records the `"tag"` field of every envelope it
/// processes, in order, and can be scripted to fail on a given 1-indexed call.
#[derive(Debug)]
pub struct RecordingConsumer {
    name: String,
    seen: Mutex<Vec<i64>>,
    fail_on: Option<usize>,
}

impl RecordingConsumer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    /// Fail (returning an error from `process` instead of recording) on the `n`th call, 1-indexed.
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }

    pub fn seen_tags(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::consumer::Consumer for RecordingConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        message: Arc<crate::message::Envelope>,
    ) -> Result<(), crate::consumer::ConsumerError> {
        let mut seen = self.seen.lock().unwrap();
        let call_number = seen.len() + 1;
        if self.fail_on == Some(call_number) {
            return Err(crate::consumer::ConsumerError::new("stubbed failure"));
        }
        let tag = message
            .as_map()
            .get("tag")
            .and_then(Value::as_i64)
            .expect("test envelopes always carry an integer \"tag\" field");
        seen.push(tag);
        Ok(())
    }
}
