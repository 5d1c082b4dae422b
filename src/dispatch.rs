//! Bounded per-model dispatch queues.
//!
//! One lane per model id. A lane with N workers is split into N shards and a
//! task is routed to shard `hash(stream_id) % N`. Every task of one stream for
//! one model therefore goes through the same FIFO and the same worker, which
//! keeps per-(stream, model) results in sequence order.
//!
//! The price is capacity: one stream never uses more than one worker of a
//! model, so extra workers only help when there are at least as many streams.
//!
//! `push` never blocks under the default policy. It is called from frame
//! source threads, and stalling decode would let the camera side time out.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use crate::config::BackpressurePolicy;
use crate::frame::Frame;
use crate::region::ResolvedRegion;
use crate::shutdown::ShutdownSignal;
use crate::stats::{bump, LaneCounters};

/// Log the first backpressure event of a lane, then every Nth.
const BACKPRESSURE_LOG_EVERY: u64 = 100;

/// One unit of inference work. Immutable once enqueued.
#[derive(Clone, Debug)]
pub struct InferenceTask {
    pub frame: Arc<Frame>,
    pub model_id: Arc<str>,
    pub region: Arc<ResolvedRegion>,
    pub enqueued_at: Instant,
}

impl InferenceTask {
    pub fn stream_id(&self) -> &str {
        &self.frame.stream_id
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    pub fn region_id(&self) -> &str {
        &self.region.id
    }
}

struct Shard {
    tx: Sender<InferenceTask>,
    rx: Receiver<InferenceTask>,
}

struct Lane {
    shards: Vec<Shard>,
    counters: Arc<LaneCounters>,
}

pub struct DispatchQueue {
    lanes: HashMap<String, Lane>,
    capacity: usize,
    policy: BackpressurePolicy,
    shutdown: ShutdownSignal,
}

impl DispatchQueue {
    /// Build one lane per `(model_id, shard_count)`, each shard holding at most
    /// `capacity` tasks.
    pub fn new(
        lanes: &[(String, usize)],
        capacity: usize,
        policy: BackpressurePolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        let lanes = lanes
            .iter()
            .map(|(model_id, shards)| {
                let shards = (0..(*shards).max(1))
                    .map(|_| {
                        let (tx, rx) = crossbeam_channel::bounded(capacity);
                        Shard { tx, rx }
                    })
                    .collect();
                (
                    model_id.clone(),
                    Lane {
                        shards,
                        counters: Arc::new(LaneCounters::default()),
                    },
                )
            })
            .collect();
        Self {
            lanes,
            capacity,
            policy,
            shutdown,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn shard_count(&self, model_id: &str) -> usize {
        self.lanes.get(model_id).map_or(0, |lane| lane.shards.len())
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.lanes.keys().map(String::as_str)
    }

    pub fn lane_counters(&self, model_id: &str) -> Option<Arc<LaneCounters>> {
        self.lanes.get(model_id).map(|lane| lane.counters.clone())
    }

    /// Queued tasks across all shards of a lane.
    pub fn len(&self, model_id: &str) -> usize {
        self.lanes
            .get(model_id)
            .map_or(0, |lane| lane.shards.iter().map(|s| s.rx.len()).sum())
    }

    pub fn is_empty(&self, model_id: &str) -> bool {
        self.len(model_id) == 0
    }

    /// Enqueue a task on its model's lane.
    ///
    /// Returns `false` when the task was not admitted: unknown model, shutdown
    /// in progress, or a full lane under `DropNewest`. Rejection is a normal
    /// backpressure outcome, not an error.
    pub fn push(&self, task: InferenceTask) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        let Some(lane) = self.lanes.get(&*task.model_id) else {
            log::warn!("dispatch: no lane for model '{}'", task.model_id);
            return false;
        };
        let shard = &lane.shards[shard_for(task.stream_id(), lane.shards.len())];

        let admitted = match self.policy {
            BackpressurePolicy::DropNewest => match shard.tx.try_send(task) {
                Ok(()) => true,
                Err(TrySendError::Full(task)) => {
                    self.signal_backpressure(&lane.counters, &task, "dropped newest");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            BackpressurePolicy::DropOldest => {
                let mut task = task;
                loop {
                    match shard.tx.try_send(task) {
                        Ok(()) => break true,
                        Err(TrySendError::Full(rejected)) => {
                            if let Ok(evicted) = shard.rx.try_recv() {
                                self.signal_backpressure(
                                    &lane.counters,
                                    &evicted,
                                    "evicted oldest",
                                );
                            }
                            task = rejected;
                        }
                        Err(TrySendError::Disconnected(_)) => break false,
                    }
                }
            }
            BackpressurePolicy::Block => {
                crossbeam_channel::select! {
                    send(shard.tx, task) -> res => res.is_ok(),
                    recv(self.shutdown.receiver()) -> _ => false,
                }
            }
        };

        if admitted {
            bump(&lane.counters.enqueued);
        }
        admitted
    }

    /// Blocking pop for one shard of a lane. Returns `None` once shutdown fires.
    ///
    /// Intended to be called only by the worker that owns `(model_id, shard)`.
    pub fn pop(&self, model_id: &str, shard: usize) -> Option<InferenceTask> {
        let rx = &self.lanes.get(model_id)?.shards.get(shard)?.rx;
        if self.shutdown.is_triggered() {
            return None;
        }
        crossbeam_channel::select! {
            recv(rx) -> msg => msg.ok(),
            recv(self.shutdown.receiver()) -> _ => None,
        }
    }

    /// Discard every queued task. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        for lane in self.lanes.values() {
            for shard in &lane.shards {
                while shard.rx.try_recv().is_ok() {
                    drained += 1;
                }
            }
        }
        drained
    }

    fn signal_backpressure(&self, counters: &LaneCounters, task: &InferenceTask, action: &str) {
        let total = match self.policy {
            BackpressurePolicy::DropOldest => bump(&counters.evicted),
            _ => bump(&counters.dropped),
        };
        if total == 1 || total % BACKPRESSURE_LOG_EVERY == 0 {
            log::warn!(
                "backpressure on lane '{}': {} task (stream={} seq={} region={}), {} so far",
                task.model_id,
                action,
                task.stream_id(),
                task.sequence(),
                task.region_id(),
                total
            );
        } else {
            log::trace!(
                "backpressure on lane '{}': {} seq={}",
                task.model_id,
                action,
                task.sequence()
            );
        }
    }
}

fn shard_for(stream_id: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    stream_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
