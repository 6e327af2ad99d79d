use crate::{
    producer::{DataProducer, ProducerIdentity, SharedProducerState},
    registry::SharedRegistry,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Handle {
    state: SharedProducerState,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    exchange: String,
}

/// Supervises the set of [`DataProducer`]s: add, remove, and drain, closing the owning exchange
/// handle via the [`Registry`](crate::registry::Registry) when a producer's removal leaves no
/// remaining reference to that exchange.
pub struct ProducerPipeline {
    registry: SharedRegistry,
    producers: Mutex<HashMap<ProducerIdentity, Handle>>,
}

impl ProducerPipeline {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            producers: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `producer` into the map and spawn its task. No-ops (logging) if `identity` is
    /// already present. Insertion is synchronous; the task starts asynchronously once spawned.
    pub async fn add_producer(&self, exchange: &str, producer: DataProducer) {
        let identity = producer.identity().clone();
        let mut producers = self.producers.lock().await;
        if producers.contains_key(&identity) {
            info!(%identity, "producer already present, skipping add");
            return;
        }

        let state = producer.state();
        let cancel = producer.cancellation_token();
        let task = tokio::spawn(producer.run());

        producers.insert(
            identity.clone(),
            Handle {
                state,
                cancel,
                task,
                exchange: exchange.to_owned(),
            },
        );
        info!(%identity, "producer added");
    }

    /// Cancel and await the producer identified by `identity`, then remove it from the map.
    /// Returns only after the task has fully terminated and, if this was the last producer
    /// referencing its exchange, after the exchange handle is closed.
    ///
    /// No-ops (logging) if `identity` is absent.
    pub async fn remove_producer(&self, identity: &ProducerIdentity) {
        let handle = {
            let mut producers = self.producers.lock().await;
            match producers.remove(identity) {
                Some(handle) => handle,
                None => {
                    info!(%identity, "remove_producer called for unknown identity, skipping");
                    return;
                }
            }
        };

        handle.cancel.cancel();
        if let Err(join_error) = handle.task.await {
            if join_error.is_panic() {
                error!(%identity, "producer task panicked during shutdown");
                let mut state = handle.state.lock().await;
                state.status = crate::producer::ProducerStatus::Errored;
            }
        }

        let still_referenced = {
            let producers = self.producers.lock().await;
            producers
                .values()
                .any(|other| other.exchange == handle.exchange)
        };

        if !still_referenced {
            if let Err(error) = self.registry.close_exchange(&handle.exchange).await {
                warn!(exchange = %handle.exchange, %error, "failed to close exchange handle during teardown");
            } else {
                info!(exchange = %handle.exchange, "exchange handle closed, no remaining producers reference it");
            }
        }
    }

    /// Remove every producer. Idempotent.
    pub async fn stop_pipeline(&self) {
        let identities: Vec<ProducerIdentity> = {
            let producers = self.producers.lock().await;
            producers.keys().cloned().collect()
        };

        for identity in identities {
            self.remove_producer(&identity).await;
        }
    }

    pub async fn contains(&self, identity: &ProducerIdentity) -> bool {
        self.producers.lock().await.contains_key(identity)
    }

    pub async fn len(&self) -> usize {
        self.producers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn state_of(&self, identity: &ProducerIdentity) -> Option<SharedProducerState> {
        self.producers
            .lock()
            .await
            .get(identity)
            .map(|handle| handle.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::StreamKind;
    use crate::registry::Registry;
    use crate::test_util::StubExchange;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn two_producer_registry() -> (SharedRegistry, Arc<StubExchange>) {
        let mut adapter = StubExchange::new(["BTC/USD"]);
        adapter.set_has(StreamKind::Ticker, Some(true));
        adapter.set_has(StreamKind::Trades, Some(true));
        let adapter = Arc::new(adapter);

        let registry = Registry::new();
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

        (Arc::new(registry), adapter)
    }

    #[tokio::test]
    async fn exchange_closes_only_after_last_producer_removed() {
        // S5 — Exchange close on last removal
        let (registry, adapter) = two_producer_registry().await;
        let pipeline = ProducerPipeline::new(Arc::clone(&registry));

        let (tx, _rx) = mpsc::unbounded_channel();
        let p1 = DataProducer::new("kraken", "BTC/USD", "watchTicker", Arc::clone(&registry), tx.clone());
        let p2 = DataProducer::new("kraken", "BTC/USD", "watchTrades", Arc::clone(&registry), tx);

        let id1 = p1.identity().clone();
        let id2 = p2.identity().clone();

        pipeline.add_producer("kraken", p1).await;
        pipeline.add_producer("kraken", p2).await;

        pipeline.remove_producer(&id1).await;
        assert_eq!(adapter.close_calls(), 0);

        pipeline.remove_producer(&id2).await;
        assert_eq!(adapter.close_calls(), 1);
    }

    #[tokio::test]
    async fn add_producer_is_idempotent_by_identity() {
        let (registry, _adapter) = two_producer_registry().await;
        let pipeline = ProducerPipeline::new(Arc::clone(&registry));

        let (tx, _rx) = mpsc::unbounded_channel();
        let p1 = DataProducer::new("kraken", "BTC/USD", "watchTicker", Arc::clone(&registry), tx.clone());
        let id = p1.identity().clone();
        pipeline.add_producer("kraken", p1).await;

        let p1_dup = DataProducer::new("kraken", "BTC/USD", "watchTicker", Arc::clone(&registry), tx);
        pipeline.add_producer("kraken", p1_dup).await;

        assert_eq!(pipeline.len().await, 1);
        pipeline.remove_producer(&id).await;
    }

    #[tokio::test]
    async fn stop_pipeline_removes_every_producer() {
        let (registry, _adapter) = two_producer_registry().await;
        let pipeline = ProducerPipeline::new(Arc::clone(&registry));

        let (tx, _rx) = mpsc::unbounded_channel();
        let p1 = DataProducer::new("kraken", "BTC/USD", "watchTicker", Arc::clone(&registry), tx.clone());
        let p2 = DataProducer::new("kraken", "BTC/USD", "watchTrades", Arc::clone(&registry), tx);
        pipeline.add_producer("kraken", p1).await;
        pipeline.add_producer("kraken", p2).await;

        pipeline.stop_pipeline().await;
        assert!(pipeline.is_empty().await);
    }
}
