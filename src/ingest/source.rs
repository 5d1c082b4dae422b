//! Per-stream frame source.
//!
//! A `FrameSource` owns one stream's decode session and stamps every decoded
//! image with the stream id, a sequence number and the capture time. The
//! sequence counter belongs to the source, not the session, so numbering
//! continues across reconnects and a number is never reused. A caller that
//! rebuilds sources (the supervisor on restart) hands the same counter to the
//! new source with `with_sequence`.
//!
//! `run` is the stream thread's body: decode, extract, push, and on any
//! session failure close and reopen with capped exponential backoff. Failures
//! never leave this module; they show up in logs and counters only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::{ReconnectPolicy, StreamSettings};
use crate::dispatch::DispatchQueue;
use crate::error::SourceError;
use crate::frame::Frame;
use crate::region::RegionExtractor;
use crate::shutdown::ShutdownSignal;
use crate::stats::{bump, StreamCounters};

use super::decoder::{Decoder, DecoderFactory};

pub struct FrameSource {
    settings: StreamSettings,
    factory: Arc<dyn DecoderFactory>,
    reconnect: ReconnectPolicy,
    decoder: Option<Box<dyn Decoder>>,
    /// Next sequence number to stamp.
    next_sequence: Arc<AtomicU64>,
    counters: Arc<StreamCounters>,
}

impl FrameSource {
    pub fn new(
        settings: StreamSettings,
        factory: Arc<dyn DecoderFactory>,
        reconnect: ReconnectPolicy,
        counters: Arc<StreamCounters>,
    ) -> Self {
        Self {
            settings,
            factory,
            reconnect,
            decoder: None,
            next_sequence: Arc::new(AtomicU64::new(1)),
            counters,
        }
    }

    /// Continue numbering from a counter that outlives this source.
    pub fn with_sequence(mut self, next_sequence: Arc<AtomicU64>) -> Self {
        self.next_sequence = next_sequence;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.settings.id
    }

    pub fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    /// Open a fresh session, replacing any existing one.
    pub fn open(&mut self) -> Result<(), SourceError> {
        self.close();
        match self.factory.open(&self.settings) {
            Ok(decoder) => {
                self.decoder = Some(decoder);
                Ok(())
            }
            Err(err) => {
                bump(&self.counters.connection_errors);
                Err(err)
            }
        }
    }

    /// Decode the next frame of the open session.
    pub fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| SourceError::Connection("stream is not open".to_string()))?;
        let sequence = self.next_sequence.load(Ordering::Relaxed);
        let result = decoder.next_frame().and_then(|image| {
            Frame::new(&self.settings.id, sequence, image, SystemTime::now())
                .map_err(|e| SourceError::Decode(format!("{:#}", e)))
        });
        match &result {
            Ok(_) => {
                self.next_sequence.store(sequence + 1, Ordering::Relaxed);
                bump(&self.counters.frames_decoded);
            }
            Err(SourceError::Decode(_)) => {
                bump(&self.counters.decode_errors);
            }
            Err(SourceError::Connection(_)) => {
                bump(&self.counters.connection_errors);
            }
            Err(SourceError::Ended) => {}
        }
        result
    }

    pub fn close(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
    }

    /// Stream thread body. Returns when shutdown fires or the reconnect
    /// ceiling is reached.
    pub fn run(
        mut self,
        extractor: &RegionExtractor,
        queue: &DispatchQueue,
        shutdown: &ShutdownSignal,
    ) {
        let stream_id = self.settings.id.clone();
        log::info!("stream {}: source started ({})", stream_id, self.settings.url);

        let mut failures: u32 = 0;
        let mut backoff = self.reconnect.initial_backoff;

        while !shutdown.is_triggered() {
            if !self.is_open() {
                if failures > 0 {
                    if let Some(max) = self.reconnect.max_attempts {
                        if failures > max {
                            log::error!(
                                "stream {}: giving up after {} reconnect attempts",
                                stream_id,
                                max
                            );
                            break;
                        }
                    }
                    log::debug!("stream {}: reconnecting in {:?}", stream_id, backoff);
                    if !shutdown.sleep(backoff) {
                        break;
                    }
                    backoff = next_backoff(backoff, self.reconnect.max_backoff);
                    bump(&self.counters.reconnects);
                }
                match self.open() {
                    Ok(()) => {
                        log::info!("stream {}: session open", stream_id);
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        log::warn!(
                            "stream {}: open failed (attempt {}): {}",
                            stream_id,
                            failures,
                            err
                        );
                        continue;
                    }
                }
            }

            match self.next_frame() {
                Ok(frame) => {
                    if failures > 0 {
                        log::info!(
                            "stream {}: recovered, resuming at sequence {}",
                            stream_id,
                            frame.sequence
                        );
                    }
                    failures = 0;
                    backoff = self.reconnect.initial_backoff;
                    self.dispatch(frame, extractor, queue);
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    match err {
                        SourceError::Ended => log::info!("stream {}: stream ended", stream_id),
                        err => log::warn!("stream {}: {}", stream_id, err),
                    }
                    self.close();
                }
            }
        }

        self.close();
        log::info!(
            "stream {}: source stopped, last sequence {}",
            stream_id,
            self.next_sequence.load(Ordering::Relaxed) - 1
        );
    }

    fn dispatch(&self, frame: Frame, extractor: &RegionExtractor, queue: &DispatchQueue) {
        if !extractor.is_sampled(frame.sequence) {
            bump(&self.counters.frames_skipped);
            return;
        }
        let frame = Arc::new(frame);
        for task in extractor.extract(&frame) {
            if queue.push(task) {
                bump(&self.counters.tasks_emitted);
            } else {
                bump(&self.counters.tasks_rejected);
            }
        }
        log::trace!("stream {}: dispatched seq={}", self.settings.id, frame.sequence);
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
