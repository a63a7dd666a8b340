//! Detector-facing types shared by the vision pipeline.
//!
//! The pipeline only depends on [`ObjectDetector`]; concrete backends live
//! behind features (`with-tch` pulls in the TorchScript detector).

use anyhow::Result;

#[cfg(feature = "with-tch")]
pub mod detector;

#[cfg(feature = "with-tch")]
pub use tch;

/// Single detection in frame-pixel coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Box centre x, centre y, width, height.
    pub bbox_xywh: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

impl Detection {
    /// Box corners as `[left, top, right, bottom]`.
    pub fn corners(&self) -> [f32; 4] {
        let [cx, cy, w, h] = self.bbox_xywh;
        [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
    }

    pub fn area(&self) -> f32 {
        self.bbox_xywh[2].max(0.0) * self.bbox_xywh[3].max(0.0)
    }
}

/// Anything that turns a BGR frame into detections.
///
/// Implementations are shared across camera threads, so they must either be
/// reentrant or serialise internally.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>>;

    /// Human readable name for a class id, if the backend knows one.
    fn class_name(&self, _class_id: i64) -> Option<&str> {
        None
    }
}

/// Detector that never finds anything. Useful to run the capture and
/// streaming path without a model.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn detect(&self, _bgr: &[u8], _width: i32, _height: i32) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Intersection over union of two detections.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let [al, at, ar, ab] = a.corners();
    let [bl, bt, br, bb] = b.corners();
    let inter_w = (ar.min(br) - al.max(bl)).max(0.0);
    let inter_h = (ab.min(bb) - at.max(bt)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy per-class non-maximum suppression.
///
/// Keeps the highest scoring box of every overlapping cluster; boxes of
/// different classes never suppress each other. Output is sorted by
/// descending score.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && iou(existing, &candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(cx: f32, cy: f32, w: f32, h: f32, score: f32, class_id: i64) -> Detection {
        Detection {
            bbox_xywh: [cx, cy, w, h],
            score,
            class_id,
        }
    }

    #[test]
    fn corners_are_derived_from_centre_and_extent() {
        assert_eq!(det(50.0, 40.0, 20.0, 10.0, 0.5, 0).corners(), [40.0, 35.0, 60.0, 45.0]);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = det(10.0, 10.0, 10.0, 10.0, 0.9, 0);
        let b = det(100.0, 100.0, 10.0, 10.0, 0.9, 0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &b), 0.0);
        let half = det(15.0, 10.0, 10.0, 10.0, 0.9, 0);
        assert!((iou(&a, &half) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_best_of_cluster_and_other_classes() {
        let detections = vec![
            det(10.0, 10.0, 10.0, 10.0, 0.6, 0),
            det(11.0, 10.0, 10.0, 10.0, 0.9, 0),
            det(11.0, 10.0, 10.0, 10.0, 0.7, 1),
            det(200.0, 200.0, 10.0, 10.0, 0.4, 0),
        ];
        let kept = non_max_suppression(detections, 0.45);
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.4]);
    }

    #[test]
    fn null_detector_reports_nothing() {
        assert!(NullDetector.detect(&[0; 12], 2, 2).unwrap().is_empty());
    }
}
