//! Inference worker pool.
//!
//! Every worker thread owns exactly one engine instance, loaded for it alone,
//! and serves exactly one shard of one model's lane. Instances are moved into
//! their thread and never shared, so no two calls can ever overlap on one
//! instance. A model configured with N workers gets N independent instances.
//!
//! Setup is all-or-nothing: every instance is loaded and warmed up before any
//! thread starts. If one load fails, the instances already loaded are dropped
//! and setup returns `PoolInit`. Workers then wait on a start gate until every
//! thread exists; if a spawn fails the gate stays shut, the started workers
//! exit without serving and are joined before `Spawn` is returned.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use crossbeam_channel::Receiver;

use crate::config::ModelSpec;
use crate::detect::{DetectionBatch, DetectionResult, EngineFactory, InferenceEngine};
use crate::dispatch::{DispatchQueue, InferenceTask};
use crate::error::PipelineError;
use crate::notify::NotifySink;
use crate::stats::{bump, LaneCounters};

struct Worker {
    name: String,
    join: JoinHandle<()>,
}

pub struct InferenceWorkerPool {
    workers: Vec<Worker>,
}

impl InferenceWorkerPool {
    /// Load one engine per worker slot, then start the workers.
    ///
    /// `queue` must have a lane per model with `model.workers` shards.
    pub fn set_up(
        models: &[ModelSpec],
        factory: &dyn EngineFactory,
        queue: Arc<DispatchQueue>,
        sink: NotifySink,
    ) -> Result<Self, PipelineError> {
        let mut loaded = Vec::new();
        for model in models {
            let counters = queue.lane_counters(&model.id).ok_or_else(|| PipelineError::PoolInit {
                model: model.id.clone(),
                source: anyhow!("dispatch queue has no lane for this model"),
            })?;
            let shards = queue.shard_count(&model.id);
            if shards != model.workers {
                return Err(PipelineError::PoolInit {
                    model: model.id.clone(),
                    source: anyhow!(
                        "lane has {} shards but {} workers are configured",
                        shards,
                        model.workers
                    ),
                });
            }
            for shard in 0..model.workers {
                let mut engine = factory.load(model).map_err(|source| PipelineError::PoolInit {
                    model: model.id.clone(),
                    source,
                })?;
                engine.warm_up().map_err(|source| PipelineError::PoolInit {
                    model: model.id.clone(),
                    source: source.context("warm-up failed"),
                })?;
                log::info!(
                    "loaded model '{}' instance {}/{} ({} engine) from {}",
                    model.id,
                    shard + 1,
                    model.workers,
                    engine.name(),
                    model.path
                );
                loaded.push((model.clone(), shard, engine, counters.clone()));
            }
        }

        let workers = start_workers(loaded, &queue, &sink, |name, ctx| {
            std::thread::Builder::new().name(name).spawn(move || ctx.run())
        })?;
        log::info!("inference pool started with {} workers", workers.len());
        Ok(Self { workers })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit. Shutdown must already be triggered; a
    /// worker in the middle of an inference call finishes it first.
    pub fn join(self) {
        for worker in self.workers {
            if worker.join.join().is_err() {
                log::error!("worker {} panicked", worker.name);
            }
        }
        log::info!("inference pool stopped");
    }
}

type LoadedEngine = (ModelSpec, usize, Box<dyn InferenceEngine>, Arc<LaneCounters>);

/// Released when its sender is dropped; `open` says whether to serve or exit.
#[derive(Clone)]
struct StartGate {
    open: Arc<AtomicBool>,
    released: Receiver<()>,
}

impl StartGate {
    fn wait(&self) -> bool {
        let _ = self.released.recv();
        self.open.load(Ordering::Acquire)
    }
}

fn start_workers<S>(
    loaded: Vec<LoadedEngine>,
    queue: &Arc<DispatchQueue>,
    sink: &NotifySink,
    mut spawn: S,
) -> Result<Vec<Worker>, PipelineError>
where
    S: FnMut(String, WorkerContext) -> std::io::Result<JoinHandle<()>>,
{
    let (release, released) = crossbeam_channel::bounded::<()>(0);
    let open = Arc::new(AtomicBool::new(false));
    let mut workers: Vec<Worker> = Vec::with_capacity(loaded.len());

    for (model, shard, engine, counters) in loaded {
        let name = format!("infer-{}-{}", model.id, shard);
        let ctx = WorkerContext {
            model,
            shard,
            engine,
            counters,
            queue: queue.clone(),
            sink: sink.clone(),
            gate: StartGate {
                open: open.clone(),
                released: released.clone(),
            },
        };
        match spawn(name.clone(), ctx) {
            Ok(join) => workers.push(Worker { name, join }),
            Err(source) => {
                drop(release);
                for worker in workers {
                    if worker.join.join().is_err() {
                        log::error!("worker {} panicked", worker.name);
                    }
                }
                return Err(PipelineError::Spawn { what: name, source });
            }
        }
    }

    open.store(true, Ordering::Release);
    drop(release);
    Ok(workers)
}

struct WorkerContext {
    model: ModelSpec,
    shard: usize,
    engine: Box<dyn InferenceEngine>,
    counters: Arc<LaneCounters>,
    queue: Arc<DispatchQueue>,
    sink: NotifySink,
    gate: StartGate,
}

impl WorkerContext {
    fn run(mut self) {
        if !self.gate.wait() {
            log::debug!("worker {}#{} discarded before start", self.model.id, self.shard);
            return;
        }
        log::debug!("worker {}#{} started", self.model.id, self.shard);
        while let Some(task) = self.queue.pop(&self.model.id, self.shard) {
            match run_task(self.engine.as_mut(), &self.model, &task) {
                Ok(batch) => {
                    bump(&self.counters.completed);
                    log::trace!(
                        "lane {} stream={} seq={} region={} waited {:?}",
                        self.model.id,
                        task.stream_id(),
                        task.sequence(),
                        task.region_id(),
                        task.enqueued_at.elapsed()
                    );
                    if let Some(batch) = batch {
                        self.sink.submit(batch);
                    }
                }
                Err(err) => {
                    bump(&self.counters.inference_failures);
                    log::warn!(
                        "inference failed on lane {} (stream={} seq={} region={}): {:#}",
                        self.model.id,
                        task.stream_id(),
                        task.sequence(),
                        task.region_id(),
                        err
                    );
                }
            }
        }
        log::debug!("worker {}#{} stopped", self.model.id, self.shard);
    }
}

/// Run one task. `Ok(None)` when nothing reportable was found.
pub(crate) fn run_task(
    engine: &mut dyn InferenceEngine,
    model: &ModelSpec,
    task: &InferenceTask,
) -> Result<Option<DetectionBatch>> {
    let frame = &task.frame;
    let Some(view) = task
        .region
        .crop_rect(frame.width, frame.height)
        .and_then(|rect| frame.crop(rect))
    else {
        return Ok(None);
    };

    let detections = catch_unwind(AssertUnwindSafe(|| engine.infer(&view)))
        .map_err(|_| anyhow!("engine '{}' panicked", engine.name()))??;

    let (origin_x, origin_y) = view.origin();
    let timestamp = frame.timestamp_ms();
    let results: Vec<DetectionResult> = detections
        .into_iter()
        .filter(|d| d.confidence >= model.confidence_threshold)
        .filter(|d| model.classes.is_empty() || model.classes.contains(&d.label))
        .map(|d| (d.label, d.confidence, d.bbox.offset(origin_x as f32, origin_y as f32)))
        .filter(|(_, _, bbox)| {
            let (cx, cy) = bbox.center();
            task.region.contains(cx, cy)
        })
        .map(|(label, confidence, bbox)| DetectionResult {
            label,
            confidence,
            bbox,
            stream_id: frame.stream_id.clone(),
            model_id: task.model_id.to_string(),
            region_id: task.region.id.clone(),
            sequence: frame.sequence,
            timestamp,
        })
        .collect();

    if results.is_empty() {
        return Ok(None);
    }
    Ok(Some(DetectionBatch {
        batch_id: DetectionBatch::batch_id_for(
            &frame.stream_id,
            &task.model_id,
            &task.region.id,
            frame.sequence,
        ),
        stream_id: frame.stream_id.clone(),
        model_id: task.model_id.to_string(),
        region_id: task.region.id.clone(),
        sequence: frame.sequence,
        timestamp,
        results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpressurePolicy, Region, RegionShape};
    use crate::detect::{BoundingBox, Detection, StubEngine};
    use crate::frame::tests::frame_with_blob;
    use crate::frame::{ImageView, PixelRect};
    use crate::region::ResolvedRegion;
    use crate::shutdown;
    use std::collections::BTreeSet;
    use std::time::Instant;

    fn spec(classes: &[&str]) -> ModelSpec {
        ModelSpec {
            id: "det1".into(),
            path: "stub://det1".into(),
            classes: classes.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            workers: 1,
            confidence_threshold: 0.25,
        }
    }

    fn task_for(frame: crate::frame::Frame, region: ResolvedRegion) -> InferenceTask {
        InferenceTask {
            frame: Arc::new(frame),
            model_id: Arc::from("det1"),
            region: Arc::new(region),
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn result_carries_task_identity_and_frame_coordinates() {
        let frame = frame_with_blob("cam7", 42, 64, 64, Some(PixelRect::new(40, 40, 4, 4)));
        let region = ResolvedRegion::from_config(&Region {
            id: "corner".into(),
            shape: RegionShape::Rect {
                x: 32,
                y: 32,
                width: 32,
                height: 32,
            },
            models: vec!["det1".into()],
        });
        let task = task_for(frame, region);
        let mut engine = StubEngine::new("person");
        let batch = run_task(&mut engine, &spec(&["person"]), &task).unwrap().unwrap();
        assert_eq!(
            (batch.stream_id.as_str(), batch.model_id.as_str(), batch.sequence),
            ("cam7", "det1", 42)
        );
        let result = &batch.results[0];
        assert_eq!(
            (result.stream_id.as_str(), result.model_id.as_str(), result.sequence),
            ("cam7", "det1", 42)
        );
        assert_eq!(result.region_id, "corner");
        assert_eq!(result.bbox, BoundingBox::new(40.0, 40.0, 4.0, 4.0));
    }

    #[test]
    fn unconfigured_classes_are_filtered() {
        let frame = frame_with_blob("cam", 1, 16, 16, Some(PixelRect::new(2, 2, 4, 4)));
        let task = task_for(frame, ResolvedRegion::full_frame());
        let mut engine = StubEngine::new("cat");
        assert!(run_task(&mut engine, &spec(&["person"]), &task).unwrap().is_none());
        assert!(run_task(&mut engine, &spec(&[]), &task).unwrap().is_some());
    }

    #[test]
    fn polygon_membership_filters_detections() {
        let frame = frame_with_blob("cam", 1, 32, 32, Some(PixelRect::new(16, 16, 4, 4)));
        let region = ResolvedRegion::from_config(&Region {
            id: "tri".into(),
            shape: RegionShape::Polygon {
                points: vec![[0, 0], [31, 0], [0, 31]],
            },
            models: vec!["det1".into()],
        });
        let task = task_for(frame, region);
        let mut engine = StubEngine::new("person");
        assert!(run_task(&mut engine, &spec(&[]), &task).unwrap().is_none());
    }

    struct PanickingEngine;

    impl InferenceEngine for PanickingEngine {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn infer(&mut self, _image: &ImageView<'_>) -> Result<Vec<Detection>> {
            panic!("engine blew up");
        }
    }

    #[test]
    fn engine_panic_becomes_task_error() {
        let frame = frame_with_blob("cam", 1, 8, 8, None);
        let task = task_for(frame, ResolvedRegion::full_frame());
        let err = run_task(&mut PanickingEngine, &spec(&[]), &task).unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    struct CountedEngine {
        dropped: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl InferenceEngine for CountedEngine {
        fn name(&self) -> &'static str {
            "counted"
        }

        fn infer(&mut self, _image: &ImageView<'_>) -> Result<Vec<Detection>> {
            Ok(Vec::new())
        }
    }

    impl Drop for CountedEngine {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn spawn_failure_joins_started_workers_before_returning() {
        let (_trigger, signal) = shutdown::channel();
        let queue = Arc::new(DispatchQueue::new(
            &[("det1".to_string(), 3)],
            4,
            BackpressurePolicy::DropNewest,
            signal,
        ));
        let counters = queue.lane_counters("det1").unwrap();
        let dropped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let loaded: Vec<LoadedEngine> = (0..3)
            .map(|shard| {
                let engine: Box<dyn InferenceEngine> = Box::new(CountedEngine {
                    dropped: dropped.clone(),
                });
                (spec(&[]), shard, engine, counters.clone())
            })
            .collect();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let sink = crate::notify::tests::sink_from(tx);

        let mut spawned = 0;
        let err = start_workers(loaded, &queue, &sink, |name, ctx| {
            spawned += 1;
            if spawned == 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "thread limit reached",
                ));
            }
            std::thread::Builder::new().name(name).spawn(move || ctx.run())
        })
        .err()
        .unwrap();

        assert_eq!(err.status_code(), -4);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
        assert_eq!(counters.snapshot("det1").completed, 0);
    }

    #[test]
    fn failed_load_aborts_setup() {
        let (_trigger, signal) = shutdown::channel();
        let mut second = spec(&[]);
        second.id = "det2".into();
        second.path = "stub://det2".into();
        let models = vec![spec(&[]), second];
        let queue = Arc::new(DispatchQueue::new(
            &[("det1".to_string(), 1), ("det2".to_string(), 1)],
            4,
            BackpressurePolicy::DropNewest,
            signal.clone(),
        ));
        let factory = |model: &ModelSpec| -> Result<Box<dyn InferenceEngine>> {
            if model.id == "det2" {
                anyhow::bail!("weights missing");
            }
            Ok(Box::new(StubEngine::new("person")))
        };
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let sink = crate::notify::tests::sink_from(tx);
        let err = InferenceWorkerPool::set_up(&models, &factory, queue, sink)
            .err()
            .unwrap();
        assert_eq!(err.status_code(), -3);
        assert!(err.to_string().contains("det2"));
    }
}
