//! Stream Detect
//!
//! Concurrent multi-camera, multi-model object detection pipeline.
//!
//! # Architecture
//!
//! Frames flow through five stages, each on its own threads:
//!
//! 1. **FrameSource** (`ingest`): one thread per stream. Owns the decode
//!    session, reconnects with capped exponential backoff, stamps frames with
//!    a per-stream sequence number that is never reused.
//! 2. **RegionExtractor** (`region`): turns a frame into one task per
//!    (region, model) pair. Pure, runs on the stream thread.
//! 3. **DispatchQueue** (`dispatch`): one bounded lane per model. A full lane
//!    drops the newest task by default; the stream thread never blocks.
//! 4. **InferenceWorkerPool** (`pool`): N workers per model, each owning its
//!    own engine instance. Loaded once per `start`, all or nothing.
//! 5. **ResultNotifier** (`notify`): posts detection batches to the hook with
//!    bounded retries, off the inference path.
//!
//! `PipelineSupervisor` (`supervisor`) owns all of it and drives the
//! `Stopped -> Starting -> Running -> Stopping -> Stopped` lifecycle.
//!
//! # Module Structure
//!
//! - `config`: configuration model, loader and validation
//! - `error`: lifecycle, stream and delivery error types
//! - `frame`: decoded frames and read-only crops
//! - `detect`: inference engine seam, built-in engines, result types
//! - `shutdown`: cancellation shared by every thread
//! - `stats`: lock-free counters and snapshots

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod pool;
pub mod region;
pub mod shutdown;
pub mod stats;
pub mod supervisor;

pub use config::{
    BackpressurePolicy, DeliveryPolicy, ModelSpec, PipelineConfig, ReconnectPolicy, Region,
    RegionShape, StreamSettings, ThreadNums,
};
pub use detect::{
    BoundingBox, BuiltinEngineFactory, Detection, DetectionBatch, DetectionResult, EngineFactory,
    InferenceEngine, StubEngine,
};
pub use dispatch::{DispatchQueue, InferenceTask};
pub use error::{DeliveryError, PipelineError, SourceError, STATUS_OK};
pub use frame::{DecodedImage, Frame, ImageView, PixelRect};
pub use ingest::{Decoder, DecoderFactory, FrameSource, UrlDecoderFactory};
pub use notify::{HookClient, HttpHookClient, ResultNotifier};
pub use pool::InferenceWorkerPool;
pub use region::{RegionExtractor, ResolvedRegion, FULL_FRAME_REGION_ID};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use stats::PipelineStats;
pub use supervisor::{PipelineState, PipelineSupervisor};
