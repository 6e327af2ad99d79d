//! Orchestration entry point: construct the Registry and both pipelines from a [`Config`],
//! then drive a guaranteed-release teardown on shutdown.

use crate::{
    config::Config,
    consumer::Consumer,
    consumer_pipeline::ConsumerPipeline,
    error::{ConfigError, RegistryError},
    exchange::{ExchangeAdapter, StreamKind},
    message::Envelope,
    producer::DataProducer,
    producer_pipeline::ProducerPipeline,
    registry::{Registry, SharedRegistry},
    shutdown::ShutdownListener,
};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Per-exchange hook the runner calls when building the Registry from configuration. The core
/// has no way to instantiate a concrete exchange client itself, so the caller supplies one
/// constructor per exchange name it wants wired up, given that exchange's `properties` map.
pub type AdapterFactory =
    Box<dyn Fn(&Map<String, serde_json::Value>) -> Box<dyn ExchangeAdapter> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no adapter factory registered for exchange '{0}'")]
    MissingAdapterFactory(String),
}

/// Owns the Registry, Producer Pipeline, and Consumer Pipeline for one run, and drives the
/// guaranteed-release teardown sequence on shutdown.
pub struct PipelineRunner {
    registry: SharedRegistry,
    producer_pipeline: Arc<ProducerPipeline>,
    consumer_pipeline: Arc<ConsumerPipeline>,
    ingress: mpsc::UnboundedSender<Envelope>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner").finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Construct the ingress queue, build the Registry from `config` (awaiting `load_markets`
    /// per exchange), construct and populate the Producer Pipeline, then construct the Consumer
    /// Pipeline, register `consumers`, and start the Delegator.
    pub async fn build(
        config: Config,
        adapter_factories: HashMap<String, AdapterFactory>,
        consumers: Vec<Arc<dyn Consumer>>,
    ) -> Result<Self, RunnerError> {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Registry::new());
        for (exchange_name, exchange_config) in &config.exchanges {
            let factory = adapter_factories
                .get(exchange_name)
                .ok_or_else(|| RunnerError::MissingAdapterFactory(exchange_name.clone()))?;
            let adapter = factory(&exchange_config.properties);
            registry
                .register_exchange(exchange_name, adapter, exchange_config.properties.clone())
                .await?;

            for (symbol, symbol_config) in &exchange_config.symbols {
                registry.register_symbol(exchange_name, symbol).await?;
                for (stream_name, stream_config) in &symbol_config.streams {
                    registry
                        .register_stream(
                            exchange_name,
                            symbol,
                            StreamKind::from(stream_name.as_str()),
                            stream_config.options.clone(),
                            Default::default(),
                        )
                        .await?;
                }
            }
        }

        let producer_pipeline = Arc::new(ProducerPipeline::new(Arc::clone(&registry)));
        for exchange_name in registry.exchange_names().await {
            for (symbol, stream) in registry.registered_triples(&exchange_name).await? {
                let producer = DataProducer::new(
                    exchange_name.clone(),
                    symbol,
                    stream,
                    Arc::clone(&registry),
                    ingress_tx.clone(),
                );
                producer_pipeline.add_producer(&exchange_name, producer).await;
            }
        }

        let consumer_pipeline = Arc::new(ConsumerPipeline::new(ingress_rx));
        for consumer in consumers {
            consumer_pipeline.add_consumer(consumer).await;
        }
        consumer_pipeline.start_delegator().await;

        Ok(Self {
            registry,
            producer_pipeline,
            consumer_pipeline,
            ingress: ingress_tx,
        })
    }

    /// Step 5: block until `shutdown` fires, then run the guaranteed-release teardown.
    pub async fn run_until_shutdown(&self, mut shutdown: ShutdownListener) {
        shutdown.recv().await;
        info!("pipeline runner received shutdown signal, tearing down");
        self.shutdown().await;
    }

    /// Step 6: stop all producers (closing exchange handles as their last reference drops), stop
    /// the Delegator, then stop all consumers. Teardown errors are logged and swallowed by the
    /// pipelines themselves; this never fails.
    pub async fn shutdown(&self) {
        self.producer_pipeline.stop_pipeline().await;
        self.consumer_pipeline.stop_delegator().await;
        self.consumer_pipeline.stop_all_consumers().await;
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn producer_pipeline(&self) -> Arc<ProducerPipeline> {
        Arc::clone(&self.producer_pipeline)
    }

    pub fn consumer_pipeline(&self) -> Arc<ConsumerPipeline> {
        Arc::clone(&self.consumer_pipeline)
    }

    /// Sender half of the ingress queue, for constructing additional producers after `build`
    /// (eg/ the `kraken` hot-add illustrated in the reference `__main__.py`).
    pub fn ingress(&self) -> mpsc::UnboundedSender<Envelope> {
        self.ingress.clone()
    }
}
