pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubEngine;

#[cfg(feature = "backend-tract")]
pub use tract::TractEngine;

use anyhow::Result;

use crate::config::ModelSpec;
use crate::detect::engine::{EngineFactory, InferenceEngine};

/// Chooses a built-in engine from the model path.
///
/// - `stub://<id>` loads a [`StubEngine`].
/// - `*.onnx` loads a `TractEngine` (feature `backend-tract`). Class names are
///   read from a sibling `<model>.names` file, one per line, when present.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinEngineFactory;

impl EngineFactory for BuiltinEngineFactory {
    fn load(&self, model: &ModelSpec) -> Result<Box<dyn InferenceEngine>> {
        if model.path.starts_with("stub://") {
            return Ok(Box::new(StubEngine::for_model(model)));
        }
        if model.path.to_ascii_lowercase().ends_with(".onnx") {
            return load_onnx(model);
        }
        anyhow::bail!(
            "no engine for model path '{}'; expected stub://<id> or an .onnx file",
            model.path
        )
    }
}

#[cfg(feature = "backend-tract")]
fn load_onnx(model: &ModelSpec) -> Result<Box<dyn InferenceEngine>> {
    let labels_path = std::path::Path::new(&model.path).with_extension("names");
    let labels = match std::fs::read_to_string(&labels_path) {
        Ok(raw) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    };
    let engine = TractEngine::new(&model.path, labels)?.with_threshold(model.confidence_threshold);
    Ok(Box::new(engine))
}

#[cfg(not(feature = "backend-tract"))]
fn load_onnx(model: &ModelSpec) -> Result<Box<dyn InferenceEngine>> {
    anyhow::bail!(
        "model '{}' is ONNX; loading it requires the backend-tract feature",
        model.id
    )
}
