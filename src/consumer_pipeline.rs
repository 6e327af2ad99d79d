use crate::{
    consumer::{Consumer, ConsumerOutcome, PrivateQueueSender},
    message::Envelope,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle status of a registered consumer, updated around its task's lifetime. Purely
/// observational, mirroring [`ProducerStatus`](crate::producer::ProducerStatus)'s role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Staged,
    Running,
    Cancelled,
    Errored,
}

pub type SharedConsumerStatus = Arc<Mutex<ConsumerStatus>>;

struct Handle {
    sender: PrivateQueueSender,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: SharedConsumerStatus,
}

/// Holds the ingress queue and the `name -> Consumer` map, and runs the Delegator: the sole
/// reader of the ingress queue, which non-blockingly copies each message into every
/// currently-registered consumer's private queue.
pub struct ConsumerPipeline {
    ingress_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    consumers: Arc<Mutex<HashMap<String, Handle>>>,
    delegator_cancel: CancellationToken,
    delegator_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerPipeline {
    pub fn new(ingress_rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            ingress_rx: Mutex::new(Some(ingress_rx)),
            consumers: Arc::new(Mutex::new(HashMap::new())),
            delegator_cancel: CancellationToken::new(),
            delegator_task: Mutex::new(None),
        }
    }

    /// Register `consumer` under `name` and launch its run loop. No-ops (logging) if `name` is
    /// already present.
    pub async fn add_consumer(&self, consumer: Arc<dyn Consumer>) {
        let name = consumer.name().to_owned();
        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(&name) {
            info!(consumer = %name, "consumer already present, skipping add");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let status: SharedConsumerStatus = Arc::new(Mutex::new(ConsumerStatus::Staged));

        let task = tokio::spawn({
            let status = Arc::clone(&status);
            let cancel = cancel.clone();
            let name = name.clone();
            async move {
                {
                    *status.lock().await = ConsumerStatus::Running;
                }
                let outcome = consumer.run(rx, cancel).await;
                *status.lock().await = match outcome {
                    ConsumerOutcome::Cancelled => ConsumerStatus::Cancelled,
                    ConsumerOutcome::Errored => ConsumerStatus::Errored,
                };
                info!(consumer = %name, ?outcome, "consumer task finished");
            }
        });

        consumers.insert(
            name.clone(),
            Handle {
                sender: tx,
                cancel,
                task,
                status,
            },
        );
        info!(consumer = %name, "consumer added");
    }

    /// Cancel and await the consumer registered under `name`, then remove it from the map. After
    /// this returns, no further messages will be delivered to it.
    pub async fn remove_consumer(&self, name: &str) {
        let handle = {
            let mut consumers = self.consumers.lock().await;
            match consumers.remove(name) {
                Some(handle) => handle,
                None => {
                    info!(consumer = %name, "remove_consumer called for unknown name, skipping");
                    return;
                }
            }
        };

        handle.cancel.cancel();
        if let Err(join_error) = handle.task.await {
            if join_error.is_panic() {
                error!(consumer = %name, "consumer task panicked during shutdown");
                *handle.status.lock().await = ConsumerStatus::Errored;
            }
        }
    }

    pub async fn status_of(&self, name: &str) -> Option<ConsumerStatus> {
        let consumers = self.consumers.lock().await;
        match consumers.get(name) {
            Some(handle) => Some(*handle.status.lock().await),
            None => None,
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.consumers.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.consumers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn the Delegator task. Calling this more than once is a logic error; only the Pipeline
    /// Runner calls it, once, after all initial consumers are registered.
    pub async fn start_delegator(self: &Arc<Self>) {
        let pipeline = Arc::clone(self);
        let cancel = self.delegator_cancel.clone();
        let task = tokio::spawn(async move { pipeline.delegate(cancel).await });
        *self.delegator_task.lock().await = Some(task);
    }

    /// Cancel the Delegator and await its (drained) termination. Idempotent.
    pub async fn stop_delegator(&self) {
        self.delegator_cancel.cancel();
        let task = self.delegator_task.lock().await.take();
        if let Some(task) = task {
            if let Err(join_error) = task.await {
                if join_error.is_panic() {
                    error!("delegator task panicked during shutdown");
                }
            }
        }
    }

    /// Remove every registered consumer. Idempotent. Does not stop the Delegator.
    pub async fn stop_all_consumers(&self) {
        let names: Vec<String> = {
            let consumers = self.consumers.lock().await;
            consumers.keys().cloned().collect()
        };
        for name in names {
            self.remove_consumer(&name).await;
        }
    }

    /// Fan out one envelope to every consumer registered at this instant, via a non-blocking put
    /// onto each private queue. A consumer whose private queue has no live receiver (its task
    /// already exited) is silently skipped; `remove_consumer` is the only way to evict it.
    async fn dispatch(&self, message: Arc<Envelope>) {
        let consumers = self.consumers.lock().await;
        for (name, handle) in consumers.iter() {
            if handle.sender.send(Arc::clone(&message)).is_err() {
                warn!(consumer = %name, "consumer private queue receiver dropped, message lost");
            }
        }
    }

    async fn delegate(&self, cancel: CancellationToken) {
        let mut ingress = self
            .ingress_rx
            .lock()
            .await
            .take()
            .expect("start_delegator called more than once");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("delegator cancelled, draining ingress queue");
                    while let Ok(message) = ingress.try_recv() {
                        self.dispatch(Arc::new(message)).await;
                    }
                    info!("delegator ingress queue drained");
                    return;
                }

                message = ingress.recv() => {
                    match message {
                        Some(message) => self.dispatch(Arc::new(message)).await,
                        None => {
                            info!("ingress queue closed, delegator exiting");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::test_util::RecordingConsumer;
    use serde_json::{Map, Value};
    use std::time::Duration;

    fn envelope(tag: i64) -> Envelope {
        let mut map = Map::new();
        map.insert("tag".into(), Value::from(tag));
        Payload::Map(map).into_envelope("stub|BTC/USD|watchTicker").unwrap()
    }

    #[tokio::test]
    async fn fan_out_delivers_every_message_to_every_consumer_in_order() {
        // S3 — Fan-out
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(ConsumerPipeline::new(ingress_rx));

        let a = Arc::new(RecordingConsumer::new("A"));
        let b = Arc::new(RecordingConsumer::new("B"));
        pipeline.add_consumer(Arc::clone(&a) as Arc<dyn Consumer>).await;
        pipeline.add_consumer(Arc::clone(&b) as Arc<dyn Consumer>).await;
        pipeline.start_delegator().await;

        ingress_tx.send(envelope(1)).unwrap();
        ingress_tx.send(envelope(2)).unwrap();
        ingress_tx.send(envelope(3)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.seen_tags(), vec![1, 2, 3]);
        assert_eq!(b.seen_tags(), vec![1, 2, 3]);

        pipeline.stop_all_consumers().await;
        pipeline.stop_delegator().await;
    }

    #[tokio::test]
    async fn delegator_cancellation_drains_queued_messages_to_current_consumers() {
        // S6 — Cancellation drain
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(ConsumerPipeline::new(ingress_rx));

        let a = Arc::new(RecordingConsumer::new("A"));
        pipeline.add_consumer(Arc::clone(&a) as Arc<dyn Consumer>).await;

        ingress_tx.send(envelope(1)).unwrap();
        ingress_tx.send(envelope(2)).unwrap();
        ingress_tx.send(envelope(3)).unwrap();

        pipeline.start_delegator().await;
        pipeline.stop_delegator().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.seen_tags(), vec![1, 2, 3]);

        pipeline.stop_all_consumers().await;
    }

    #[tokio::test]
    async fn add_consumer_is_idempotent_by_name() {
        let (_ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(ConsumerPipeline::new(ingress_rx));

        let a = Arc::new(RecordingConsumer::new("A"));
        let a_dup = Arc::new(RecordingConsumer::new("A"));
        pipeline.add_consumer(a as Arc<dyn Consumer>).await;
        pipeline.add_consumer(a_dup as Arc<dyn Consumer>).await;

        assert_eq!(pipeline.len().await, 1);
        pipeline.stop_all_consumers().await;
    }

    #[tokio::test]
    async fn remove_consumer_stops_delivery() {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(ConsumerPipeline::new(ingress_rx));

        let a = Arc::new(RecordingConsumer::new("A"));
        pipeline.add_consumer(Arc::clone(&a) as Arc<dyn Consumer>).await;
        pipeline.start_delegator().await;

        ingress_tx.send(envelope(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.remove_consumer("A").await;
        assert!(!pipeline.contains("A").await);

        ingress_tx.send(envelope(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.seen_tags(), vec![1]);

        pipeline.stop_delegator().await;
    }
}
