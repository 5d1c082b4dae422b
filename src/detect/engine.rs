use anyhow::Result;

use crate::config::ModelSpec;
use crate::detect::result::Detection;
use crate::frame::ImageView;

/// A loaded, stateful inference context.
///
/// # Ownership
///
/// Each instance is owned by exactly one worker thread for its whole life and is
/// never shared, so `infer` takes `&mut self` and implementations need not be
/// reentrant. `Send` is required only to move the instance onto its worker.
pub trait InferenceEngine: Send {
    /// Engine identifier for logs.
    fn name(&self) -> &'static str;

    /// Run inference on an image region.
    ///
    /// Boxes are returned relative to `image` (origin at its top-left corner).
    /// The view is borrowed for the duration of the call only.
    fn infer(&mut self, image: &ImageView<'_>) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once right after loading. A failure aborts
    /// pool setup like a failed load.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Loads one independent engine instance per call.
///
/// The pool calls `load` once per worker. A failure aborts pool setup.
pub trait EngineFactory: Send + Sync {
    fn load(&self, model: &ModelSpec) -> Result<Box<dyn InferenceEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&ModelSpec) -> Result<Box<dyn InferenceEngine>> + Send + Sync,
{
    fn load(&self, model: &ModelSpec) -> Result<Box<dyn InferenceEngine>> {
        self(model)
    }
}
