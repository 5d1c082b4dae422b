//! Pipeline lifecycle.
//!
//! `PipelineSupervisor` owns everything that runs: the shutdown trigger, the
//! dispatch queue, the worker pool (and through it every model instance), the
//! notifier thread and one source thread per stream. Streams receive what
//! they need by reference at spawn time; nothing is global.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! `start` while running and `stop` while stopped are no-ops. A failed
//! `start` tears down whatever it had built and returns to `Stopped`.
//!
//! Per-stream sequence counters live as long as the supervisor, so a
//! `stop`/`start` cycle keeps numbering where it left off and batch ids stay
//! unique.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::config::PipelineConfig;
use crate::detect::{BuiltinEngineFactory, EngineFactory};
use crate::dispatch::DispatchQueue;
use crate::error::{PipelineError, STATUS_OK};
use crate::ingest::{stream_options, DecoderFactory, FrameSource, UrlDecoderFactory};
use crate::notify::{HookClient, HttpHookClient, ResultNotifier};
use crate::pool::InferenceWorkerPool;
use crate::region::RegionExtractor;
use crate::shutdown::{self, ShutdownTrigger};
use crate::stats::{LaneStats, PipelineStats, StreamCounters};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct SourceThread {
    stream_id: String,
    counters: Arc<StreamCounters>,
    join: JoinHandle<()>,
}

struct Running {
    trigger: ShutdownTrigger,
    queue: Arc<DispatchQueue>,
    pool: InferenceWorkerPool,
    notifier: ResultNotifier,
    sources: Vec<SourceThread>,
}

impl Running {
    fn stats(&self) -> PipelineStats {
        PipelineStats {
            streams: self
                .sources
                .iter()
                .map(|s| s.counters.snapshot(&s.stream_id))
                .collect(),
            lanes: lane_stats(&self.queue),
            notifier: self.notifier.counters().snapshot(),
        }
    }
}

fn lane_stats(queue: &DispatchQueue) -> Vec<LaneStats> {
    let mut lanes: Vec<LaneStats> = queue
        .model_ids()
        .filter_map(|id| queue.lane_counters(id).map(|c| c.snapshot(id)))
        .collect();
    lanes.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    lanes
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    /// Snapshot taken at the end of the last `stop`.
    last_stats: PipelineStats,
    /// Next sequence number per stream id, kept across restarts.
    sequences: HashMap<String, Arc<AtomicU64>>,
}

pub struct PipelineSupervisor {
    config: Arc<PipelineConfig>,
    engines: Arc<dyn EngineFactory>,
    decoders: Arc<dyn DecoderFactory>,
    hook: Arc<dyn HookClient>,
    lifecycle: Mutex<Lifecycle>,
    state: Mutex<PipelineState>,
}

impl PipelineSupervisor {
    /// Supervisor with the built-in engines, URL-selected decoders and an
    /// HTTP hook client for `config.hook_http_url`.
    pub fn new(config: PipelineConfig) -> Self {
        let hook = HttpHookClient::new(&config.hook_http_url, config.delivery.request_timeout);
        Self {
            config: Arc::new(config),
            engines: Arc::new(BuiltinEngineFactory),
            decoders: Arc::new(UrlDecoderFactory::new()),
            hook: Arc::new(hook),
            lifecycle: Mutex::new(Lifecycle::default()),
            state: Mutex::new(PipelineState::Stopped),
        }
    }

    pub fn with_engine_factory(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = engines;
        self
    }

    pub fn with_decoder_factory(mut self, decoders: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn with_hook_client(mut self, hook: Arc<dyn HookClient>) -> Self {
        self.hook = hook;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(PipelineState::Stopped)
    }

    /// Start the pipeline. Idempotent while running.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lock_lifecycle()?;
        if lifecycle.running.is_some() {
            log::debug!("start: pipeline already running");
            return Ok(());
        }
        self.set_state(PipelineState::Starting);
        log::info!(
            "starting pipeline: {} models, {} streams",
            self.config.model_paths.len(),
            self.config.streams.len()
        );
        match self.launch(&mut lifecycle.sequences) {
            Ok(running) => {
                lifecycle.running = Some(running);
                self.set_state(PipelineState::Running);
                log::info!("pipeline running");
                Ok(())
            }
            Err(err) => {
                self.set_state(PipelineState::Stopped);
                log::error!("pipeline start failed: {}", err);
                Err(err)
            }
        }
    }

    /// Stop the pipeline and wait for every thread. No-op when stopped.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lock_lifecycle()?;
        let Some(running) = lifecycle.running.take() else {
            log::debug!("stop: pipeline not running");
            return Ok(());
        };
        self.set_state(PipelineState::Stopping);
        log::info!("stopping pipeline");

        let Running {
            trigger,
            queue,
            pool,
            notifier,
            sources,
        } = running;

        trigger.trigger();
        let mut streams = Vec::with_capacity(sources.len());
        for source in sources {
            if source.join.join().is_err() {
                log::error!("stream {}: source thread panicked", source.stream_id);
            }
            streams.push(source.counters.snapshot(&source.stream_id));
        }

        let drained = queue.drain();
        if drained > 0 {
            log::info!("discarded {} queued inference tasks", drained);
        }
        pool.join();
        let delivery = notifier.counters();
        notifier.stop();

        lifecycle.last_stats = PipelineStats {
            streams,
            lanes: lane_stats(&queue),
            notifier: delivery.snapshot(),
        };

        self.set_state(PipelineState::Stopped);
        log::info!("pipeline stopped");
        Ok(())
    }

    /// `start` as an integer status: 0 or a negative failure code.
    pub fn start_status(&self) -> i32 {
        match self.start() {
            Ok(()) => STATUS_OK,
            Err(err) => err.status_code(),
        }
    }

    /// `stop` as an integer status: 0 or a negative failure code.
    pub fn stop_status(&self) -> i32 {
        match self.stop() {
            Ok(()) => STATUS_OK,
            Err(err) => err.status_code(),
        }
    }

    /// Live counters while running, the final snapshot otherwise.
    pub fn stats(&self) -> PipelineStats {
        match self.lifecycle.lock() {
            Ok(lifecycle) => match &lifecycle.running {
                Some(running) => running.stats(),
                None => lifecycle.last_stats.clone(),
            },
            Err(_) => PipelineStats::default(),
        }
    }

    fn launch(
        &self,
        sequences: &mut HashMap<String, Arc<AtomicU64>>,
    ) -> Result<Running, PipelineError> {
        self.config.validate().map_err(PipelineError::Config)?;

        let (trigger, signal) = shutdown::channel();
        let models = self.config.models();
        let lanes: Vec<(String, usize)> = models.iter().map(|m| (m.id.clone(), m.workers)).collect();
        let queue = Arc::new(DispatchQueue::new(
            &lanes,
            self.config.queue_capacity,
            self.config.backpressure,
            signal.clone(),
        ));

        let notifier =
            ResultNotifier::spawn(self.hook.clone(), self.config.delivery.clone(), signal.clone())?;

        let pool = match InferenceWorkerPool::set_up(
            &models,
            self.engines.as_ref(),
            queue.clone(),
            notifier.sink(),
        ) {
            Ok(pool) => pool,
            Err(err) => {
                trigger.trigger();
                notifier.stop();
                return Err(err);
            }
        };

        log::debug!("stream options: {:?}", stream_options());

        let mut sources = Vec::with_capacity(self.config.streams.len());
        for settings in &self.config.streams {
            let counters = Arc::new(StreamCounters::default());
            let extractor = RegionExtractor::from_config(&self.config, &settings.id);
            let thread_settings = settings.clone();
            let decoders = self.decoders.clone();
            let reconnect = self.config.reconnect.clone();
            let thread_counters = counters.clone();
            let next_sequence = sequences
                .entry(settings.id.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(1)))
                .clone();
            let queue_ref = queue.clone();
            let stream_signal = signal.clone();
            // Decoder sessions are not `Send`, so the source is built on its own thread.
            let spawned = std::thread::Builder::new()
                .name(format!("source-{}", settings.id))
                .spawn(move || {
                    let source =
                        FrameSource::new(thread_settings, decoders, reconnect, thread_counters)
                            .with_sequence(next_sequence);
                    source.run(&extractor, &queue_ref, &stream_signal);
                });
            match spawned {
                Ok(join) => sources.push(SourceThread {
                    stream_id: settings.id.clone(),
                    counters,
                    join,
                }),
                Err(err) => {
                    trigger.trigger();
                    for started in sources {
                        let _ = started.join.join();
                    }
                    pool.join();
                    notifier.stop();
                    return Err(PipelineError::Spawn {
                        what: format!("source-{}", settings.id),
                        source: err,
                    });
                }
            }
        }

        Ok(Running {
            trigger,
            queue,
            pool,
            notifier,
            sources,
        })
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>, PipelineError> {
        self.lifecycle
            .lock()
            .map_err(|_| PipelineError::InvalidState("pipeline lifecycle lock poisoned"))
    }

    fn set_state(&self, next: PipelineState) {
        if let Ok(mut state) = self.state.lock() {
            log::debug!("pipeline state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}

impl Drop for PipelineSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("pipeline stop on drop failed: {}", err);
        }
    }
}
