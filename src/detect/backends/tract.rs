#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::engine::InferenceEngine;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::ImageView;

const DEFAULT_INPUT_SIZE: u32 = 640;
const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based YOLO engine for ONNX models.
///
/// Expects a single `[1, 3, S, S]` f32 input and a `[1, 4 + C, N]` output
/// (centre-x, centre-y, width, height, then one score per class), as exported
/// by YOLOv8/YOLO11.
pub struct TractEngine {
    model: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    input_size: u32,
    confidence_threshold: f32,
}

impl TractEngine {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = DEFAULT_INPUT_SIZE as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            labels,
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: 0.25,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, image: &ImageView<'_>) -> Result<Tensor> {
        let rgb = RgbImage::from_raw(image.width(), image.height(), image.to_rgb().into_owned())
            .ok_or_else(|| anyhow!("region buffer does not match its dimensions"))?;
        let resized = image::imageops::resize(
            &rgb,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );
        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, image: &ImageView<'_>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let candidates = shape[2];
        let sx = image.width() as f32 / self.input_size as f32;
        let sy = image.height() as f32 / self.input_size as f32;

        let mut found = Vec::new();
        for i in 0..candidates {
            let (class_id, score) = (0..classes)
                .map(|c| (c, view[[0, 4 + c, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (
                view[[0, 0, i]],
                view[[0, 1, i]],
                view[[0, 2, i]],
                view[[0, 3, i]],
            );
            found.push((
                class_id,
                Detection {
                    label: self
                        .labels
                        .get(class_id)
                        .cloned()
                        .unwrap_or_else(|| format!("class_{}", class_id)),
                    confidence: score,
                    bbox: BoundingBox::new((cx - w / 2.0) * sx, (cy - h / 2.0) * sy, w * sx, h * sy),
                },
            ));
        }
        Ok(non_max_suppression(found, NMS_IOU_THRESHOLD))
    }
}

/// Class-wise greedy NMS, highest confidence first.
fn non_max_suppression(mut found: Vec<(usize, Detection)>, iou_threshold: f32) -> Vec<Detection> {
    found.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));
    let mut kept: Vec<(usize, Detection)> = Vec::new();
    for (class_id, det) in found {
        let overlaps = kept
            .iter()
            .any(|(k, d)| *k == class_id && d.bbox.iou(&det.bbox) > iou_threshold);
        if !overlaps {
            kept.push((class_id, det));
        }
    }
    kept.into_iter().map(|(_, d)| d).collect()
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, image: &ImageView<'_>) -> Result<Vec<Detection>> {
        let input = self.build_input(image)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, image)
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::<f32>::zeros((1, 3, size, size)).into_tensor();
        self.model
            .run(tvec!(input.into()))
            .context("ONNX warm-up failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(confidence: f32, x: f32) -> Detection {
        Detection {
            label: "person".into(),
            confidence,
            bbox: BoundingBox::new(x, 0.0, 10.0, 10.0),
        }
    }

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let kept = non_max_suppression(
            vec![(0, det(0.6, 1.0)), (0, det(0.9, 0.0)), (1, det(0.5, 0.0))],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.5);
    }
}
