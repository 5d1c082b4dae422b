mod backends;
mod engine;
mod result;

pub use backends::{BuiltinEngineFactory, StubEngine};
#[cfg(feature = "backend-tract")]
pub use backends::TractEngine;
pub use engine::{EngineFactory, InferenceEngine};
pub use result::{BoundingBox, Detection, DetectionBatch, DetectionResult};
