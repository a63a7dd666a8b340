//! Reduction of a detection set to one telemetry record per tracked class.

use std::time::Instant;

use ml_core::Detection;

/// Angular position of the best detection of one class, or its absence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TelemetryFrame {
    pub(crate) class_id: u8,
    /// Degrees right of the optical axis.
    pub(crate) x_offset_deg: f32,
    /// Degrees above the optical axis.
    pub(crate) y_offset_deg: f32,
    /// Seconds between capture and encoding.
    pub(crate) latency_s: f32,
    pub(crate) detected: bool,
}

impl TelemetryFrame {
    pub(crate) fn not_detected(class_id: u8) -> Self {
        Self {
            class_id,
            x_offset_deg: 0.0,
            y_offset_deg: 0.0,
            latency_s: 0.0,
            detected: false,
        }
    }
}

/// Geometry needed to turn pixel positions into angles.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CameraGeometry {
    pub(crate) width: f32,
    pub(crate) height: f32,
    pub(crate) hfov_deg: f32,
    pub(crate) vfov_deg: f32,
}

impl CameraGeometry {
    /// Linear interpolation of the box centre's offset from the frame midpoint
    /// over the field of view.
    pub(crate) fn angular_offset(&self, cx: f32, cy: f32) -> (f32, f32) {
        if self.width <= 0.0 || self.height <= 0.0 {
            return (0.0, 0.0);
        }
        let x = (cx - self.width / 2.0) / self.width * self.hfov_deg;
        let y = (self.height / 2.0 - cy) / self.height * self.vfov_deg;
        (x, y)
    }
}

/// Highest scoring detection of `class_id` whose score is strictly above `floor`.
pub(crate) fn best_for_class(
    detections: &[Detection],
    class_id: i64,
    floor: f32,
) -> Option<&Detection> {
    detections
        .iter()
        .filter(|det| det.class_id == class_id && det.score > floor)
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

/// One record per class id in `0..tracked_classes`, in class order.
pub(crate) fn telemetry_frames(
    detections: &[Detection],
    geometry: &CameraGeometry,
    tracked_classes: u8,
    floor: f32,
    captured_at: Instant,
    now: Instant,
) -> Vec<TelemetryFrame> {
    let latency_s = now.saturating_duration_since(captured_at).as_secs_f32();
    (0..tracked_classes)
        .map(|class_id| match best_for_class(detections, i64::from(class_id), floor) {
            Some(det) => {
                let (x_offset_deg, y_offset_deg) =
                    geometry.angular_offset(det.bbox_xywh[0], det.bbox_xywh[1]);
                TelemetryFrame {
                    class_id,
                    x_offset_deg,
                    y_offset_deg,
                    latency_s,
                    detected: true,
                }
            }
            None => TelemetryFrame::not_detected(class_id),
        })
        .collect()
}
