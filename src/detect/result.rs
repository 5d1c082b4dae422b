use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Axis-aligned box in pixel coordinates (top-left corner + size).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn offset(self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..self
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One object reported by an engine, relative to the image it was given.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// One detected object, attributed to the frame and lane it came from.
///
/// Bounding boxes are in full-frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub stream_id: String,
    pub model_id: String,
    pub region_id: String,
    pub sequence: u64,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Everything one inference task produced. One batch = one hook call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionBatch {
    /// Stable across retries so receivers can de-duplicate.
    pub batch_id: String,
    pub stream_id: String,
    pub model_id: String,
    pub region_id: String,
    pub sequence: u64,
    pub timestamp: u64,
    pub results: Vec<DetectionResult>,
}

impl DetectionBatch {
    /// Deterministic id for a (stream, model, region, sequence) task.
    pub fn batch_id_for(stream_id: &str, model_id: &str, region_id: &str, sequence: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(stream_id.as_bytes());
        hasher.update(b"|");
        hasher.update(model_id.as_bytes());
        hasher.update(b"|");
        hasher.update(region_id.as_bytes());
        hasher.update(b"|");
        hasher.update(sequence.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}
