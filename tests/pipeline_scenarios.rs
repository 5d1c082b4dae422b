use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use anyhow::Result;

use stream_detect::config::{
    DeliveryPolicy, ModelSpec, PipelineConfig, ReconnectPolicy, Region, RegionShape,
    StreamSettings, ThreadNums,
};
use stream_detect::detect::{Detection, DetectionBatch, InferenceEngine, StubEngine};
use stream_detect::error::{DeliveryError, SourceError};
use stream_detect::frame::{DecodedImage, ImageView};
use stream_detect::ingest::{Decoder, DecoderFactory, UrlDecoderFactory};
use stream_detect::notify::HookClient;
use stream_detect::{PipelineState, PipelineSupervisor, STATUS_OK};

const WAIT: Duration = Duration::from_secs(10);

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[derive(Default)]
struct RecordingHook {
    batches: Mutex<Vec<DetectionBatch>>,
}

impl RecordingHook {
    fn batches(&self) -> Vec<DetectionBatch> {
        self.batches.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl HookClient for RecordingHook {
    fn post(&self, body: &str) -> Result<(), DeliveryError> {
        let batch: DetectionBatch =
            serde_json::from_str(body).map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

#[derive(Default)]
struct FailingHook {
    calls: AtomicUsize,
}

impl HookClient for FailingHook {
    fn post(&self, _body: &str) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Transient("connection refused".into()))
    }
}

fn stream(id: &str, url: &str) -> StreamSettings {
    StreamSettings {
        id: id.into(),
        url: url.into(),
    }
}

fn full_frame_region(size: u32) -> Region {
    Region {
        id: "all".into(),
        shape: RegionShape::Rect {
            x: 0,
            y: 0,
            width: size,
            height: size,
        },
        models: vec!["det1".into()],
    }
}

/// One stub model "det1" detecting "person", fast retries and reconnects.
fn base_config(streams: Vec<StreamSettings>) -> PipelineConfig {
    PipelineConfig {
        model_paths: vec!["stub://det1".into()],
        model_classes: HashMap::from([(
            "det1".to_string(),
            BTreeSet::from(["person".to_string()]),
        )]),
        thread_nums: ThreadNums::Global(1),
        streams,
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_attempts: Some(2),
        },
        delivery: DeliveryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            ..DeliveryPolicy::default()
        },
        ..PipelineConfig::default()
    }
}

fn sequences(batches: &[DetectionBatch], stream_id: &str) -> Vec<u64> {
    batches
        .iter()
        .filter(|b| b.stream_id == stream_id)
        .map(|b| b.sequence)
        .collect()
}

#[test]
fn three_frames_yield_three_ordered_person_notifications() -> Result<()> {
    let mut cfg = base_config(vec![stream("cam1", "stub://cam1?frames=3&fps=0&width=64&height=64")]);
    cfg.regions.insert("cam1".into(), vec![full_frame_region(64)]);
    let hook = Arc::new(RecordingHook::default());
    let supervisor = PipelineSupervisor::new(cfg).with_hook_client(hook.clone());

    supervisor.start()?;
    assert!(wait_for(|| hook.count() >= 3));
    std::thread::sleep(Duration::from_millis(50));
    supervisor.stop()?;

    let batches = hook.batches();
    assert_eq!(batches.len(), 3);
    assert_eq!(sequences(&batches, "cam1"), vec![1, 2, 3]);
    for batch in &batches {
        assert_eq!(batch.results.len(), 1);
        let result = &batch.results[0];
        assert_eq!(result.label, "person");
        assert_eq!(
            (result.stream_id.as_str(), result.model_id.as_str(), result.sequence),
            (batch.stream_id.as_str(), batch.model_id.as_str(), batch.sequence)
        );
        assert_eq!((batch.model_id.as_str(), batch.region_id.as_str()), ("det1", "all"));
        assert_eq!(
            batch.batch_id,
            DetectionBatch::batch_id_for("cam1", "det1", "all", batch.sequence)
        );
    }
    Ok(())
}

#[test]
fn failing_hook_counts_three_delivery_failures_and_keeps_running() -> Result<()> {
    let cfg = base_config(vec![stream("cam1", "stub://cam1?frames=3&fps=0&width=32&height=32")]);
    let hook = Arc::new(FailingHook::default());
    let supervisor = PipelineSupervisor::new(cfg).with_hook_client(hook.clone());

    supervisor.start()?;
    assert!(wait_for(|| supervisor.stats().notifier.failures == 3));
    assert_eq!(supervisor.state(), PipelineState::Running);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 9);
    assert_eq!(supervisor.stats().notifier.delivered, 0);
    assert_eq!(supervisor.stop_status(), STATUS_OK);
    assert_eq!(supervisor.stats().notifier.failures, 3);
    Ok(())
}

#[test]
fn failed_connects_resume_without_reusing_sequence_numbers() -> Result<()> {
    let cfg = base_config(vec![stream(
        "cam1",
        "stub://cam1?fail_connects=2&frames=3&fps=0&width=32&height=32",
    )]);
    let hook = Arc::new(RecordingHook::default());
    let supervisor = PipelineSupervisor::new(cfg).with_hook_client(hook.clone());

    supervisor.start()?;
    assert!(wait_for(|| hook.count() >= 3));
    let stats = supervisor.stats();
    supervisor.stop()?;

    assert_eq!(sequences(&hook.batches(), "cam1"), vec![1, 2, 3]);
    let cam = stats.stream("cam1").expect("cam1 stats");
    assert!(cam.connection_errors >= 2);
    assert!(cam.reconnects >= 2);
    assert_eq!(cam.frames_decoded, 3);
    Ok(())
}

#[test]
fn restart_continues_sequence_numbers_and_batch_ids() -> Result<()> {
    let cfg = base_config(vec![stream("cam1", "stub://cam1?fps=50&width=32&height=32")]);
    let hook = Arc::new(RecordingHook::default());
    let supervisor = PipelineSupervisor::new(cfg).with_hook_client(hook.clone());

    supervisor.start()?;
    assert!(wait_for(|| hook.count() >= 2));
    supervisor.stop()?;
    let first_run = hook.count();
    let last_before_restart = sequences(&hook.batches(), "cam1")
        .into_iter()
        .max()
        .expect("first run delivered batches");

    supervisor.start()?;
    assert!(wait_for(|| hook.count() >= first_run + 2));
    supervisor.stop()?;

    let batches = hook.batches();
    let second_run = &batches[first_run..];
    assert!(second_run
        .iter()
        .all(|b| b.sequence > last_before_restart));
    let ids: HashSet<&str> = batches.iter().map(|b| b.batch_id.as_str()).collect();
    assert_eq!(ids.len(), batches.len());
    Ok(())
}

/// Streams whose id starts with "bad" open fine and then fail every decode.
struct BrokenStreams {
    inner: UrlDecoderFactory,
    broken_opens: AtomicUsize,
}

struct AlwaysCorrupt;

impl Decoder for AlwaysCorrupt {
    fn next_frame(&mut self) -> Result<DecodedImage, SourceError> {
        std::thread::sleep(Duration::from_millis(1));
        Err(SourceError::Decode("corrupt bitstream".into()))
    }
}

impl DecoderFactory for BrokenStreams {
    fn open(&self, settings: &StreamSettings) -> Result<Box<dyn Decoder>, SourceError> {
        if settings.id.starts_with("bad") {
            self.broken_opens.fetch_add(1, Ordering::SeqCst);
            return Ok(Box::new(AlwaysCorrupt));
        }
        self.inner.open(settings)
    }
}

#[test]
fn decode_failures_on_one_stream_do_not_stop_another() -> Result<()> {
    let mut cfg = base_config(vec![
        stream("bad_cam", "scripted://bad_cam"),
        stream("good_cam", "stub://good_cam?frames=5&fps=0&width=32&height=32"),
    ]);
    cfg.reconnect.max_attempts = None;
    let decoders = Arc::new(BrokenStreams {
        inner: UrlDecoderFactory::new(),
        broken_opens: AtomicUsize::new(0),
    });
    let hook = Arc::new(RecordingHook::default());
    let supervisor = PipelineSupervisor::new(cfg)
        .with_decoder_factory(decoders.clone())
        .with_hook_client(hook.clone());

    supervisor.start()?;
    assert!(wait_for(|| hook.count() >= 5));
    assert!(wait_for(|| decoders.broken_opens.load(Ordering::SeqCst) >= 3));
    let stats = supervisor.stats();
    supervisor.stop()?;

    assert_eq!(sequences(&hook.batches(), "good_cam"), vec![1, 2, 3, 4, 5]);
    assert!(sequences(&hook.batches(), "bad_cam").is_empty());
    let bad = stats.stream("bad_cam").expect("bad_cam stats");
    assert!(bad.decode_errors >= 2);
    assert_eq!(bad.frames_decoded, 0);
    Ok(())
}

/// Asserts single entrance per instance and records which threads used it.
struct ExclusiveEngine {
    inner: StubEngine,
    id: usize,
    busy: AtomicBool,
    violations: Arc<AtomicUsize>,
    callers: Arc<Mutex<HashMap<usize, HashSet<ThreadId>>>>,
}

impl InferenceEngine for ExclusiveEngine {
    fn name(&self) -> &'static str {
        "exclusive"
    }

    fn infer(&mut self, image: &ImageView<'_>) -> Result<Vec<Detection>> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.callers
            .lock()
            .unwrap()
            .entry(self.id)
            .or_default()
            .insert(std::thread::current().id());
        std::thread::sleep(Duration::from_millis(2));
        let detections = self.inner.infer(image);
        self.busy.store(false, Ordering::SeqCst);
        detections
    }
}

#[test]
fn model_instances_are_never_entered_concurrently() -> Result<()> {
    let mut cfg = base_config(
        (0..4)
            .map(|i| {
                let id = format!("cam{}", i);
                let url = format!("stub://{}?frames=10&fps=0&width=32&height=32", id);
                stream(&id, &url)
            })
            .collect(),
    );
    cfg.thread_nums = ThreadNums::Global(2);
    cfg.queue_capacity = 64;

    let loads = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let callers: Arc<Mutex<HashMap<usize, HashSet<ThreadId>>>> = Arc::default();
    let factory = {
        let loads = loads.clone();
        let violations = violations.clone();
        let callers = callers.clone();
        move |model: &ModelSpec| -> Result<Box<dyn InferenceEngine>> {
            let id = loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ExclusiveEngine {
                inner: StubEngine::for_model(model),
                id,
                busy: AtomicBool::new(false),
                violations: violations.clone(),
                callers: callers.clone(),
            }))
        }
    };
    let hook = Arc::new(RecordingHook::default());
    let supervisor = PipelineSupervisor::new(cfg)
        .with_engine_factory(Arc::new(factory))
        .with_hook_client(hook.clone());

    supervisor.start()?;
    assert!(wait_for(|| hook.count() >= 40));
    supervisor.stop()?;

    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    for threads in callers.lock().unwrap().values() {
        assert_eq!(threads.len(), 1);
    }
    let batches = hook.batches();
    for i in 0..4 {
        let id = format!("cam{}", i);
        assert_eq!(sequences(&batches, &id), (1..=10).collect::<Vec<u64>>());
    }
    Ok(())
}

#[test]
fn second_start_does_not_reload_models() -> Result<()> {
    let mut cfg = base_config(vec![stream("cam1", "stub://cam1?fps=50&width=32&height=32")]);
    cfg.model_paths.push("stub://det2".into());
    cfg.thread_nums = ThreadNums::PerModel(HashMap::from([("det2".to_string(), 3)]));

    let loads = Arc::new(AtomicUsize::new(0));
    let factory = {
        let loads = loads.clone();
        move |model: &ModelSpec| -> Result<Box<dyn InferenceEngine>> {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubEngine::for_model(model)))
        }
    };
    let supervisor = PipelineSupervisor::new(cfg)
        .with_engine_factory(Arc::new(factory))
        .with_hook_client(Arc::new(RecordingHook::default()));

    assert_eq!(supervisor.start_status(), STATUS_OK);
    assert_eq!(loads.load(Ordering::SeqCst), 4);
    assert_eq!(supervisor.start_status(), STATUS_OK);
    assert_eq!(loads.load(Ordering::SeqCst), 4);

    assert_eq!(supervisor.stop_status(), STATUS_OK);
    assert_eq!(supervisor.start_status(), STATUS_OK);
    assert_eq!(loads.load(Ordering::SeqCst), 8);
    assert_eq!(supervisor.stop_status(), STATUS_OK);
    Ok(())
}

#[test]
fn failed_model_load_fails_start_with_pool_status() {
    let mut cfg = base_config(vec![stream("cam1", "stub://cam1?fps=0")]);
    cfg.model_paths.push("stub://det2".into());
    let factory = |model: &ModelSpec| -> Result<Box<dyn InferenceEngine>> {
        if model.id == "det2" {
            anyhow::bail!("weights corrupt");
        }
        Ok(Box::new(StubEngine::for_model(model)))
    };
    let hook = Arc::new(RecordingHook::default());
    let supervisor = PipelineSupervisor::new(cfg)
        .with_engine_factory(Arc::new(factory))
        .with_hook_client(hook.clone());

    assert_eq!(supervisor.start_status(), -3);
    assert_eq!(supervisor.state(), PipelineState::Stopped);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hook.count(), 0);
    assert!(supervisor.stats().streams.is_empty());
}

struct SlowEngine(StubEngine);

impl InferenceEngine for SlowEngine {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn infer(&mut self, image: &ImageView<'_>) -> Result<Vec<Detection>> {
        std::thread::sleep(Duration::from_millis(20));
        self.0.infer(image)
    }
}

#[test]
fn overloaded_lane_drops_work_without_stalling_decode() -> Result<()> {
    let mut cfg = base_config(vec![stream("cam1", "stub://cam1?frames=50&fps=0&width=32&height=32")]);
    cfg.queue_capacity = 2;
    let factory = |model: &ModelSpec| -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(SlowEngine(StubEngine::for_model(model))))
    };
    let hook = Arc::new(RecordingHook::default());
    let supervisor = PipelineSupervisor::new(cfg)
        .with_engine_factory(Arc::new(factory))
        .with_hook_client(hook.clone());

    supervisor.start()?;
    assert!(wait_for(|| {
        supervisor
            .stats()
            .stream("cam1")
            .is_some_and(|s| s.tasks_emitted + s.tasks_rejected == 50)
    }));
    let stats = supervisor.stats();
    supervisor.stop()?;

    let lane = stats.lane("det1").expect("det1 lane");
    assert!(lane.dropped > 0);
    let cam = stats.stream("cam1").expect("cam1 stats");
    assert_eq!(cam.frames_decoded, 50);
    assert_eq!(cam.tasks_rejected, lane.dropped);

    let delivered = sequences(&hook.batches(), "cam1");
    assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}
