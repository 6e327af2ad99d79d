use crate::message::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error returned by [`Consumer::process`]. Propagating one terminates the consumer's task;
/// other consumers keep running unaffected.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConsumerError(pub String);

impl ConsumerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// How a [`Consumer`]'s run loop terminated. Purely informational, mirroring
/// [`ProducerStatus`](crate::producer::ProducerStatus)'s observational role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    Cancelled,
    Errored,
}

pub type PrivateQueueReceiver = mpsc::UnboundedReceiver<Arc<Envelope>>;
pub type PrivateQueueSender = mpsc::UnboundedSender<Arc<Envelope>>;

/// A user-supplied sink with a private inbound queue and a `process` operation per message.
///
/// The default [`run`](Consumer::run) loop implements the mandatory drain-on-cancel contract:
/// dequeue and process until cancelled, then greedily empty the private queue before returning.
/// A user-supplied consumer may override `run` and take responsibility for its own cancellation
/// handling instead.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Used as the key in the [`ConsumerPipeline`](crate::consumer_pipeline::ConsumerPipeline)'s
    /// map and in log lines; need not be unique across implementations, only across registrations.
    fn name(&self) -> &str;

    /// Handle one message. An `Err` terminates this consumer's task; other consumers are
    /// unaffected.
    async fn process(&self, message: Arc<Envelope>) -> Result<(), ConsumerError>;

    async fn run(self: Arc<Self>, mut queue: PrivateQueueReceiver, cancel: CancellationToken) -> ConsumerOutcome {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(consumer = self.name(), "consumer cancelled, draining private queue");
                    while let Ok(message) = queue.try_recv() {
                        if let Err(error) = self.process(message).await {
                            error!(consumer = self.name(), %error, "consumer process failed while draining");
                            return ConsumerOutcome::Errored;
                        }
                    }
                    info!(consumer = self.name(), "consumer private queue drained");
                    return ConsumerOutcome::Cancelled;
                }

                message = queue.recv() => {
                    match message {
                        Some(message) => {
                            if let Err(error) = self.process(message).await {
                                error!(consumer = self.name(), %error, "consumer process failed, terminating");
                                return ConsumerOutcome::Errored;
                            }
                        }
                        // Sender side gone: the pipeline has been torn down out from under us.
                        None => return ConsumerOutcome::Cancelled,
                    }
                }
            }
        }
    }
}
