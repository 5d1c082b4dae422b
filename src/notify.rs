//! Detection hook delivery.
//!
//! Workers hand finished batches to a [`NotifySink`], which never blocks: if the
//! notifier's backlog is full the batch is dropped and counted. A dedicated
//! notifier thread posts each batch to the hook with bounded, jittered
//! exponential backoff. Transient failures (transport errors, 408, 429, 5xx)
//! are retried. Anything else is permanent, logged and dropped.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use rand::Rng;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::DeliveryPolicy;
use crate::detect::DetectionBatch;
use crate::error::{DeliveryError, PipelineError};
use crate::shutdown::ShutdownSignal;
use crate::stats::{bump, NotifierCounters};

/// Transport seam for the hook endpoint.
pub trait HookClient: Send + Sync {
    /// POST one JSON body. `Ok` only for a 2xx response.
    fn post(&self, body: &str) -> Result<(), DeliveryError>;
}

/// `ureq`-backed hook client.
pub struct HttpHookClient {
    agent: ureq::Agent,
    url: String,
}

impl HttpHookClient {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: url.to_string(),
        }
    }
}

impl HookClient for HttpHookClient {
    fn post(&self, body: &str) -> Result<(), DeliveryError> {
        match self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(body)
        {
            Ok(response) if (200..300).contains(&response.status()) => Ok(()),
            Ok(response) => Err(classify_status(response.status())),
            Err(ureq::Error::Status(code, _)) => Err(classify_status(code)),
            Err(ureq::Error::Transport(transport)) => match transport.kind() {
                ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
                    Err(DeliveryError::Permanent(transport.to_string()))
                }
                _ => Err(DeliveryError::Transient(transport.to_string())),
            },
        }
    }
}

/// Map a non-2xx HTTP status onto the retry policy.
pub fn classify_status(code: u16) -> DeliveryError {
    match code {
        408 | 429 | 500..=599 => DeliveryError::Transient(format!("hook returned HTTP {}", code)),
        _ => DeliveryError::Permanent(format!("hook returned HTTP {}", code)),
    }
}

/// Deliver one batch, retrying transient failures per `policy`.
///
/// Backoff sleeps are cut short by shutdown, in which case the last error is
/// returned without further attempts.
pub fn deliver_with_retry(
    client: &dyn HookClient,
    batch: &DetectionBatch,
    policy: &DeliveryPolicy,
    shutdown: &ShutdownSignal,
    counters: &NotifierCounters,
) -> Result<(), DeliveryError> {
    let body = serde_json::to_string(batch)
        .map_err(|e| DeliveryError::Permanent(format!("serialize batch: {}", e)))?;
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match client.post(&body) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                bump(&counters.retries);
                log::warn!(
                    "hook delivery attempt {}/{} for batch {} failed: {}",
                    attempt,
                    policy.max_attempts,
                    batch.batch_id,
                    err
                );
                if !shutdown.sleep(jittered(backoff)) {
                    return Err(err);
                }
                backoff = next_backoff(backoff, policy.max_backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// +/-20% jitter so many lanes retrying at once do not synchronize.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
}

/// Non-blocking handle used by inference workers.
#[derive(Clone)]
pub struct NotifySink {
    tx: Sender<DetectionBatch>,
    counters: Arc<NotifierCounters>,
}

impl NotifySink {
    /// Queue a batch for delivery. Returns `false` if it was dropped.
    pub fn submit(&self, batch: DetectionBatch) -> bool {
        match self.tx.try_send(batch) {
            Ok(()) => true,
            Err(TrySendError::Full(batch)) => {
                let total = bump(&self.counters.backlog_dropped);
                log::warn!(
                    "notifier backlog full, dropping batch {} (stream={} model={} seq={}), {} dropped so far",
                    batch.batch_id,
                    batch.stream_id,
                    batch.model_id,
                    batch.sequence,
                    total
                );
                false
            }
            Err(TrySendError::Disconnected(batch)) => {
                log::debug!("notifier stopped, discarding batch {}", batch.batch_id);
                false
            }
        }
    }
}

/// Owns the notifier thread.
pub struct ResultNotifier {
    sink: NotifySink,
    counters: Arc<NotifierCounters>,
    join: Option<JoinHandle<()>>,
}

impl ResultNotifier {
    pub fn spawn(
        client: Arc<dyn HookClient>,
        policy: DeliveryPolicy,
        shutdown: ShutdownSignal,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = crossbeam_channel::bounded(policy.queue_capacity);
        let counters = Arc::new(NotifierCounters::default());
        let thread_counters = counters.clone();
        let join = std::thread::Builder::new()
            .name("notifier".to_string())
            .spawn(move || run_notifier(rx, client, policy, shutdown, thread_counters))
            .map_err(|source| PipelineError::Spawn {
                what: "notifier".to_string(),
                source,
            })?;
        Ok(Self {
            sink: NotifySink {
                tx,
                counters: counters.clone(),
            },
            counters,
            join: Some(join),
        })
    }

    pub fn sink(&self) -> NotifySink {
        self.sink.clone()
    }

    pub fn counters(&self) -> Arc<NotifierCounters> {
        self.counters.clone()
    }

    /// Join the notifier thread. Shutdown must already be triggered.
    ///
    /// The delivery in progress finishes its current attempt; batches still
    /// queued are discarded and counted.
    pub fn stop(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("notifier thread panicked");
            }
        }
    }
}

fn run_notifier(
    rx: Receiver<DetectionBatch>,
    client: Arc<dyn HookClient>,
    policy: DeliveryPolicy,
    shutdown: ShutdownSignal,
    counters: Arc<NotifierCounters>,
) {
    log::info!("notifier started");
    loop {
        let next = crossbeam_channel::select! {
            recv(rx) -> msg => msg.ok(),
            recv(shutdown.receiver()) -> _ => None,
        };
        let Some(batch) = next else {
            break;
        };
        match deliver_with_retry(client.as_ref(), &batch, &policy, &shutdown, &counters) {
            Ok(()) => {
                bump(&counters.delivered);
                log::debug!(
                    "delivered batch {} ({} results, stream={} model={} seq={})",
                    batch.batch_id,
                    batch.results.len(),
                    batch.stream_id,
                    batch.model_id,
                    batch.sequence
                );
            }
            Err(err) => {
                bump(&counters.failures);
                log::error!(
                    "dropping batch {} (stream={} model={} seq={}): {}",
                    batch.batch_id,
                    batch.stream_id,
                    batch.model_id,
                    batch.sequence,
                    err
                );
            }
        }
    }
    let discarded = rx.try_iter().count();
    if discarded > 0 {
        counters
            .backlog_dropped
            .fetch_add(discarded as u64, std::sync::atomic::Ordering::Relaxed);
        log::warn!("notifier stopping, discarded {} undelivered batches", discarded);
    }
    log::info!("notifier stopped");
}
