//! Region-of-interest extraction.
//!
//! Turns one frame into zero or more inference tasks: one per (region, model)
//! pair configured for the frame's stream. A stream without regions is
//! inspected as a single implicit full-frame region against every model.
//!
//! Extraction is pure. Pixels are not copied here; a task carries the shared
//! frame and the region geometry, and the worker crops when it runs.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{PipelineConfig, Region, RegionShape};
use crate::dispatch::InferenceTask;
use crate::frame::{Frame, PixelRect};

/// Region id reported for streams with no configured regions.
pub const FULL_FRAME_REGION_ID: &str = "full_frame";

#[derive(Clone, Debug, PartialEq)]
pub enum RegionGeometry {
    FullFrame,
    Rect(PixelRect),
    Polygon {
        bounds: PixelRect,
        points: Vec<(f32, f32)>,
    },
}

/// A region prepared for per-frame use.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRegion {
    pub id: String,
    pub geometry: RegionGeometry,
    pub models: Vec<Arc<str>>,
}

impl ResolvedRegion {
    pub fn full_frame() -> Self {
        Self {
            id: FULL_FRAME_REGION_ID.to_string(),
            geometry: RegionGeometry::FullFrame,
            models: Vec::new(),
        }
    }

    pub fn from_config(region: &Region) -> Self {
        let geometry = match &region.shape {
            RegionShape::Rect {
                x,
                y,
                width,
                height,
            } => RegionGeometry::Rect(PixelRect::new(*x, *y, *width, *height)),
            RegionShape::Polygon { points } => {
                let min_x = points.iter().map(|p| p[0]).min().unwrap_or(0);
                let min_y = points.iter().map(|p| p[1]).min().unwrap_or(0);
                let max_x = points.iter().map(|p| p[0]).max().unwrap_or(0);
                let max_y = points.iter().map(|p| p[1]).max().unwrap_or(0);
                RegionGeometry::Polygon {
                    bounds: PixelRect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1),
                    points: points.iter().map(|p| (p[0] as f32, p[1] as f32)).collect(),
                }
            }
        };
        Self {
            id: region.id.clone(),
            geometry,
            models: region.models.iter().map(|m| Arc::from(m.as_str())).collect(),
        }
    }

    /// Rectangle to crop from a `width` x `height` frame. `None` if the region
    /// lies entirely outside it.
    pub fn crop_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
        match &self.geometry {
            RegionGeometry::FullFrame => PixelRect::full(width, height).clamp_to(width, height),
            RegionGeometry::Rect(rect) => rect.clamp_to(width, height),
            RegionGeometry::Polygon { bounds, .. } => bounds.clamp_to(width, height),
        }
    }

    /// Whether a frame-coordinate point belongs to the region.
    ///
    /// Rectangles are already enforced by the crop, so only polygons test here.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        match &self.geometry {
            RegionGeometry::FullFrame | RegionGeometry::Rect(_) => true,
            RegionGeometry::Polygon { points, .. } => point_in_polygon(points, x, y),
        }
    }
}

/// Even-odd ray casting.
fn point_in_polygon(points: &[(f32, f32)], x: f32, y: f32) -> bool {
    let mut inside = false;
    let mut j = points.len().wrapping_sub(1);
    for i in 0..points.len() {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Stream-local extractor. Owned by the stream's frame source thread.
pub struct RegionExtractor {
    stream_id: String,
    regions: Vec<Arc<ResolvedRegion>>,
    stride: u64,
}

impl RegionExtractor {
    /// `model_ids` are used only for the implicit full-frame region.
    pub fn new(stream_id: &str, regions: &[Region], model_ids: &[String], stride: u64) -> Self {
        let regions = if regions.is_empty() {
            let mut implicit = ResolvedRegion::full_frame();
            implicit.models = model_ids.iter().map(|m| Arc::from(m.as_str())).collect();
            vec![Arc::new(implicit)]
        } else {
            regions
                .iter()
                .map(|r| Arc::new(ResolvedRegion::from_config(r)))
                .collect()
        };
        Self {
            stream_id: stream_id.to_string(),
            regions,
            stride: stride.max(1),
        }
    }

    pub fn from_config(cfg: &PipelineConfig, stream_id: &str) -> Self {
        Self::new(
            stream_id,
            cfg.regions_for(stream_id),
            &cfg.model_ids(),
            cfg.frame_stride,
        )
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn regions(&self) -> &[Arc<ResolvedRegion>] {
        &self.regions
    }

    /// Sequence numbers start at 1; with stride N frames 1, 1+N, 1+2N... are kept.
    pub fn is_sampled(&self, sequence: u64) -> bool {
        sequence.saturating_sub(1) % self.stride == 0
    }

    /// One task per (region, model) for a sampled frame.
    pub fn extract(&self, frame: &Arc<Frame>) -> Vec<InferenceTask> {
        if !self.is_sampled(frame.sequence) {
            return Vec::new();
        }
        let now = Instant::now();
        let mut tasks = Vec::new();
        for region in &self.regions {
            if region.crop_rect(frame.width, frame.height).is_none() {
                log::debug!(
                    "stream {}: region '{}' lies outside {}x{} frame",
                    self.stream_id,
                    region.id,
                    frame.width,
                    frame.height
                );
                continue;
            }
            for model in &region.models {
                tasks.push(InferenceTask {
                    frame: frame.clone(),
                    model_id: model.clone(),
                    region: region.clone(),
                    enqueued_at: now,
                });
            }
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::frame_with_blob;

    fn rect_region(id: &str, models: &[&str], x: u32, y: u32, w: u32, h: u32) -> Region {
        Region {
            id: id.into(),
            shape: RegionShape::Rect {
                x,
                y,
                width: w,
                height: h,
            },
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn one_task_per_region_and_model() {
        let regions = vec![
            rect_region("door", &["det1", "det2"], 0, 0, 8, 8),
            rect_region("yard", &["det2"], 8, 8, 8, 8),
        ];
        let extractor = RegionExtractor::new("cam1", &regions, &[], 1);
        let frame = Arc::new(frame_with_blob("cam1", 1, 32, 32, None));
        let tasks = extractor.extract(&frame);
        let pairs: Vec<(&str, &str)> = tasks
            .iter()
            .map(|t| (t.region_id(), &*t.model_id))
            .collect();
        assert_eq!(pairs, vec![("door", "det1"), ("door", "det2"), ("yard", "det2")]);
        assert!(tasks.iter().all(|t| t.sequence() == 1 && t.stream_id() == "cam1"));
    }

    #[test]
    fn no_regions_means_full_frame_for_all_models() {
        let models = vec!["det1".to_string(), "det2".to_string()];
        let extractor = RegionExtractor::new("cam1", &[], &models, 1);
        let frame = Arc::new(frame_with_blob("cam1", 1, 16, 16, None));
        let tasks = extractor.extract(&frame);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.region_id() == FULL_FRAME_REGION_ID));
    }

    #[test]
    fn stride_skips_frames() {
        let models = vec!["det1".to_string()];
        let extractor = RegionExtractor::new("cam1", &[], &models, 3);
        let kept: Vec<u64> = (1..=7)
            .filter(|seq| {
                let frame = Arc::new(frame_with_blob("cam1", *seq, 4, 4, None));
                !extractor.extract(&frame).is_empty()
            })
            .collect();
        assert_eq!(kept, vec![1, 4, 7]);
    }

    #[test]
    fn regions_outside_the_frame_emit_nothing() {
        let regions = vec![rect_region("far", &["det1"], 100, 100, 8, 8)];
        let extractor = RegionExtractor::new("cam1", &regions, &[], 1);
        let frame = Arc::new(frame_with_blob("cam1", 1, 32, 32, None));
        assert!(extractor.extract(&frame).is_empty());
    }

    #[test]
    fn polygon_bounds_and_membership() {
        let region = ResolvedRegion::from_config(&Region {
            id: "tri".into(),
            shape: RegionShape::Polygon {
                points: vec![[0, 0], [10, 0], [0, 10]],
            },
            models: vec!["det1".into()],
        });
        assert_eq!(region.crop_rect(64, 64), Some(PixelRect::new(0, 0, 11, 11)));
        assert!(region.contains(2.0, 2.0));
        assert!(!region.contains(8.0, 8.0));
    }
}
