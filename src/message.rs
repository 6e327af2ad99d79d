use serde_json::{Map, Value};

/// The key injected into every outgoing [`Envelope`], carrying the
/// [`ProducerIdentity`](crate::producer::ProducerIdentity) of the producer that emitted it.
pub const PRODUCER_KEY: &str = "producer";

/// A raw payload returned by an [`ExchangeAdapter`](crate::exchange::ExchangeAdapter) fetch
/// method, prior to provenance tagging.
///
/// Per the Design Notes on heterogeneous payloads: a mapping, an ordered sequence, or anything
/// else (dropped by the producer with a warning).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Map(Map<String, Value>),
    Seq(Vec<Value>),
    Other(Value),
}

impl Payload {
    /// Build the envelope placed on the ingress queue: a mapping with the raw payload plus the
    /// producer identity.
    ///
    /// - `Map(m)` becomes `m` with `"producer"` overwritten to `producer`.
    /// - `Seq(s)` becomes `{"data": s, "producer": producer}`.
    /// - `Other(_)` has no envelope; callers should have already dropped it with a warning.
    pub fn into_envelope(self, producer: &str) -> Option<Envelope> {
        match self {
            Payload::Map(mut map) => {
                map.insert(PRODUCER_KEY.to_owned(), Value::String(producer.to_owned()));
                Some(Envelope(map))
            }
            Payload::Seq(seq) => {
                let mut map = Map::with_capacity(2);
                map.insert("data".to_owned(), Value::Array(seq));
                map.insert(PRODUCER_KEY.to_owned(), Value::String(producer.to_owned()));
                Some(Envelope(map))
            }
            Payload::Other(_) => None,
        }
    }
}

/// The message envelope placed on the ingress queue: the raw payload (mapping or wrapped
/// sequence) plus the producer identity that emitted it.
///
/// Cloning an [`Envelope`] is cheap relative to re-serializing it, but the Delegator never
/// clones the underlying `Map` data itself — it wraps it in an [`std::sync::Arc`] so every
/// consumer sees the identical allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// The `"producer"` field value, if present and a string.
    pub fn producer(&self) -> Option<&str> {
        self.0.get(PRODUCER_KEY).and_then(Value::as_str)
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        Value::Object(envelope.0)
    }
}
