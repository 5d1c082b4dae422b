//! Lock-free pipeline counters and their serializable snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Increment and return the new value.
pub(crate) fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Default)]
pub struct StreamCounters {
    pub frames_decoded: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub tasks_emitted: AtomicU64,
    pub tasks_rejected: AtomicU64,
    pub reconnects: AtomicU64,
    pub connection_errors: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl StreamCounters {
    pub fn snapshot(&self, stream_id: &str) -> StreamStats {
        StreamStats {
            stream_id: stream_id.to_string(),
            frames_decoded: load(&self.frames_decoded),
            frames_skipped: load(&self.frames_skipped),
            tasks_emitted: load(&self.tasks_emitted),
            tasks_rejected: load(&self.tasks_rejected),
            reconnects: load(&self.reconnects),
            connection_errors: load(&self.connection_errors),
            decode_errors: load(&self.decode_errors),
        }
    }
}

#[derive(Debug, Default)]
pub struct LaneCounters {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub evicted: AtomicU64,
    pub completed: AtomicU64,
    pub inference_failures: AtomicU64,
}

impl LaneCounters {
    pub fn snapshot(&self, model_id: &str) -> LaneStats {
        LaneStats {
            model_id: model_id.to_string(),
            enqueued: load(&self.enqueued),
            dropped: load(&self.dropped),
            evicted: load(&self.evicted),
            completed: load(&self.completed),
            inference_failures: load(&self.inference_failures),
        }
    }
}

#[derive(Debug, Default)]
pub struct NotifierCounters {
    pub delivered: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub backlog_dropped: AtomicU64,
}

impl NotifierCounters {
    pub fn snapshot(&self) -> NotifierStats {
        NotifierStats {
            delivered: load(&self.delivered),
            retries: load(&self.retries),
            failures: load(&self.failures),
            backlog_dropped: load(&self.backlog_dropped),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub stream_id: String,
    pub frames_decoded: u64,
    pub frames_skipped: u64,
    pub tasks_emitted: u64,
    pub tasks_rejected: u64,
    pub reconnects: u64,
    pub connection_errors: u64,
    pub decode_errors: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub model_id: String,
    pub enqueued: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub completed: u64,
    pub inference_failures: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NotifierStats {
    pub delivered: u64,
    pub retries: u64,
    pub failures: u64,
    pub backlog_dropped: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub streams: Vec<StreamStats>,
    pub lanes: Vec<LaneStats>,
    pub notifier: NotifierStats,
}

impl PipelineStats {
    pub fn lane(&self, model_id: &str) -> Option<&LaneStats> {
        self.lanes.iter().find(|lane| lane.model_id == model_id)
    }

    pub fn stream(&self, stream_id: &str) -> Option<&StreamStats> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }
}
