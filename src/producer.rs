use crate::{
    error::FetchError,
    message::Envelope,
    registry::{FetchDispatchError, SharedRegistry},
};
use chrono::{DateTime, Utc};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default consecutive-failure ceiling before a producer escalates to [`ProducerStatus::Errored`].
pub const DEFAULT_MAX_TRIES: u32 = 4;

/// Starting backoff interval; doubled after each transient failure (uncapped).
const INITIAL_TIMEOUT_SECS: f64 = 1.0;

/// `"{exchange}|{symbol}|{stream}"` — globally unique within a [`ProducerPipeline`](crate::producer_pipeline::ProducerPipeline).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerIdentity(String);

impl ProducerIdentity {
    pub fn new(exchange: &str, symbol: &str, stream: &str) -> Self {
        Self(format!("{exchange}|{symbol}|{stream}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProducerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a [`DataProducer`]. Purely informational — the run loop is gated only by
/// cancellation, never by this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStatus {
    Staged,
    Running,
    Backoff,
    Cancelled,
    Errored,
}

/// Observable state of a [`DataProducer`], updated at every status transition.
#[derive(Debug, Clone)]
pub struct ProducerState {
    pub status: ProducerStatus,
    pub tries: u32,
    pub timeout: Duration,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

impl ProducerState {
    fn staged() -> Self {
        Self {
            status: ProducerStatus::Staged,
            tries: 0,
            timeout: Duration::from_secs_f64(INITIAL_TIMEOUT_SECS),
            last_error: None,
            since: Utc::now(),
        }
    }

    fn transition(&mut self, status: ProducerStatus) {
        self.status = status;
        self.since = Utc::now();
    }
}

/// Shared, lock-guarded handle to a producer's observable state, read by external callers (eg/
/// monitoring, or the `__main__`-style example in `demos/`) while the run loop mutates it.
pub type SharedProducerState = Arc<Mutex<ProducerState>>;

/// One long-lived task for a single (exchange, symbol, stream) triple. Repeatedly invokes the
/// Registry's resolved fetch method, tags each payload with its producer identity, and enqueues
/// into the shared ingress queue. Absorbs transient errors with exponential backoff up to
/// `max_tries`.
#[derive(Debug)]
pub struct DataProducer {
    identity: ProducerIdentity,
    exchange: String,
    symbol: String,
    stream: String,
    max_tries: u32,
    registry: SharedRegistry,
    ingress: mpsc::UnboundedSender<Envelope>,
    state: SharedProducerState,
    cancel: CancellationToken,
}

impl DataProducer {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        stream: impl Into<String>,
        registry: SharedRegistry,
        ingress: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let exchange = exchange.into();
        let symbol = symbol.into();
        let stream = stream.into();
        let identity = ProducerIdentity::new(&exchange, &symbol, &stream);
        Self {
            identity,
            exchange,
            symbol,
            stream,
            max_tries: DEFAULT_MAX_TRIES,
            registry,
            ingress,
            state: Arc::new(Mutex::new(ProducerState::staged())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn identity(&self) -> &ProducerIdentity {
        &self.identity
    }

    pub fn state(&self) -> SharedProducerState {
        Arc::clone(&self.state)
    }

    /// The token a supervisor cancels to request orderly stop. Cloned so the supervisor keeps a
    /// handle independent of the spawned task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the episode loop until cancelled or terminally errored.
    ///
    /// The producer never drains on cancellation: any in-flight fetch is abandoned, in contrast
    /// to the Consumer's drain-on-cancel behavior.
    pub async fn run(self) {
        {
            let mut state = self.state.lock().await;
            state.transition(ProducerStatus::Running);
        }

        loop {
            let fetch = self.registry.fetch(&self.exchange, &self.symbol, &self.stream);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!(producer = %self.identity, "producer cancelled, abandoning in-flight fetch");
                    let mut state = self.state.lock().await;
                    state.transition(ProducerStatus::Cancelled);
                    return;
                }

                result = fetch => {
                    match result {
                        Ok(payload) => self.handle_success(payload).await,
                        Err(FetchDispatchError::Fetch(FetchError::Transient(reason))) => {
                            if self.handle_transient(reason).await {
                                return;
                            }
                        }
                        Err(other) => {
                            self.handle_fatal(other.to_string()).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_success(&self, payload: crate::message::Payload) {
        let mut state = self.state.lock().await;
        state.transition(ProducerStatus::Running);
        state.tries = 0;
        state.timeout = Duration::from_secs_f64(INITIAL_TIMEOUT_SECS);
        drop(state);

        match payload.into_envelope(self.identity.as_str()) {
            Some(envelope) => {
                if self.ingress.send(envelope).is_err() {
                    warn!(producer = %self.identity, "ingress queue receiver dropped, message lost");
                }
            }
            None => {
                warn!(producer = %self.identity, "dropping payload of unsupported shape");
            }
        }
    }

    /// Returns `true` if the producer should terminate (max_tries exceeded).
    async fn handle_transient(&self, reason: String) -> bool {
        let (tries, timeout, terminate) = {
            let mut state = self.state.lock().await;
            state.transition(ProducerStatus::Backoff);
            state.tries += 1;
            state.last_error = Some(reason.clone());
            let terminate = state.tries >= self.max_tries;
            if terminate {
                state.transition(ProducerStatus::Errored);
            }
            (state.tries, state.timeout, terminate)
        };

        if terminate {
            error!(
                producer = %self.identity,
                tries,
                %reason,
                "producer exceeded max_tries, terminating as errored"
            );
            return true;
        }

        warn!(producer = %self.identity, tries, timeout_secs = timeout.as_secs_f64(), %reason, "transient error, backing off");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let mut state = self.state.lock().await;
                state.transition(ProducerStatus::Cancelled);
                return true;
            }
            _ = tokio::time::sleep(timeout) => {}
        }

        let mut state = self.state.lock().await;
        state.timeout *= 2;
        false
    }

    async fn handle_fatal(&self, reason: String) {
        let mut state = self.state.lock().await;
        state.transition(ProducerStatus::Errored);
        state.last_error = Some(reason.clone());
        drop(state);
        error!(producer = %self.identity, %reason, "unclassified error, terminating without retry");
    }
}
