#![warn(rust_2018_idioms)]

//! Producer/consumer supervision core for multi-exchange real-time market data pipelines.
//!
//! A [`Registry`](registry::Registry) tracks which exchanges, symbols, and streams are active; a
//! [`DataProducer`](producer::DataProducer) per (exchange, symbol, stream) triple fetches from an
//! [`ExchangeAdapter`](exchange::ExchangeAdapter) and tags each payload with its producer
//! identity; the [`ConsumerPipeline`](consumer_pipeline::ConsumerPipeline)'s Delegator
//! non-blockingly fans every message out to every registered [`Consumer`](consumer::Consumer).
//! The [`PipelineRunner`](runner::PipelineRunner) wires all of this together from a
//! [`Config`](config::Config).
//!
//! The exchange client itself — the real websocket plumbing — is out of scope: this crate is
//! written entirely against the [`ExchangeAdapter`] trait.

pub mod config;
pub mod consumer;
pub mod consumer_pipeline;
pub mod error;
pub mod exchange;
pub mod message;
pub mod producer;
pub mod producer_pipeline;
pub mod registry;
pub mod runner;
pub mod shutdown;

#[doc(hidden)]
pub mod test_util;

pub use config::Config;
pub use consumer::{Consumer, ConsumerError};
pub use consumer_pipeline::ConsumerPipeline;
pub use exchange::ExchangeAdapter;
pub use message::{Envelope, Payload};
pub use producer::DataProducer;
pub use producer_pipeline::ProducerPipeline;
pub use registry::Registry;
pub use runner::PipelineRunner;
