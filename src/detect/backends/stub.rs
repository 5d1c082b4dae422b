use anyhow::Result;

use crate::config::ModelSpec;
use crate::detect::engine::InferenceEngine;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::ImageView;

const BRIGHT_LUMA: u32 = 200;
const MIN_BLOB_PIXELS: usize = 4;
const FALLBACK_LABEL: &str = "object";

/// Stub engine for tests and `stub://` models.
///
/// Reports every 4-connected blob of bright pixels as one object, labelled with
/// the model's first configured class.
pub struct StubEngine {
    label: String,
    confidence_threshold: f32,
}

impl StubEngine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            confidence_threshold: 0.0,
        }
    }

    pub fn for_model(model: &ModelSpec) -> Self {
        let label = model
            .classes
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| FALLBACK_LABEL.to_string());
        Self::new(label).with_threshold(model.confidence_threshold)
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, image: &ImageView<'_>) -> Result<Vec<Detection>> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let mut bright = vec![false; width * height];
        for y in 0..height {
            let row = image.row(y as u32);
            for x in 0..width {
                let px = &row[x * 3..x * 3 + 3];
                // Integer BT.601 luma.
                let luma = (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) / 1000;
                bright[y * width + x] = luma >= BRIGHT_LUMA;
            }
        }

        let mut detections = Vec::new();
        let mut visited = vec![false; width * height];
        let mut stack = Vec::new();
        for start in 0..bright.len() {
            if !bright[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (width, height, 0, 0);
            let mut count = 0usize;
            while let Some(idx) = stack.pop() {
                let (x, y) = (idx % width, idx / width);
                count += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
                let mut visit = |n: usize| {
                    if bright[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(idx - 1);
                }
                if x + 1 < width {
                    visit(idx + 1);
                }
                if y > 0 {
                    visit(idx - width);
                }
                if y + 1 < height {
                    visit(idx + width);
                }
            }
            if count < MIN_BLOB_PIXELS {
                continue;
            }
            let box_w = (max_x - min_x + 1) as f32;
            let box_h = (max_y - min_y + 1) as f32;
            let fill = count as f32 / (box_w * box_h);
            let confidence = 0.5 + 0.5 * fill;
            if confidence < self.confidence_threshold {
                continue;
            }
            detections.push(Detection {
                label: self.label.clone(),
                confidence,
                bbox: BoundingBox::new(min_x as f32, min_y as f32, box_w, box_h),
            });
        }
        Ok(detections)
    }
}
