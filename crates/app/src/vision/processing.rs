//! Per-camera detection task.
//!
//! Each task drains its camera's capture slot, runs the shared detector,
//! burns in the overlay and fans the result out to telemetry, snapshots,
//! the stream hub and (optionally) the display. A detector or overlay error
//! skips that frame only.

use std::{
    io,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::RecvTimeoutError;
use ml_core::{Detection, ObjectDetector};
use tracing::{debug, error, info, warn};
use video_ingest::Frame;

use crate::vision::{
    annotation::annotate_frame,
    config::VisionConfig,
    data::{AnnotatedFrame, DetectionSet, DetectionSummary, FramePacket},
    encoding::encode_jpeg,
    handoff::{LatestReceiver, LatestSender},
    link::TelemetryLink,
    shutdown::ShutdownToken,
    snapshot::{SnapshotGate, SnapshotKind, SnapshotPayload, SnapshotRequest, SnapshotSubmitter},
    source::SourceExit,
    stream::StreamHub,
    targeting::{CameraGeometry, telemetry_frames},
    telemetry,
    watchdog::{CameraHealth, Stage},
};

/// Elapsed times at or below this are treated as zero.
const MIN_ELAPSED_S: f64 = 1e-6;

/// `1 / elapsed` rounded to two decimals, or 0 when `elapsed` is too small.
pub(crate) fn instantaneous_rate(elapsed: Duration) -> f32 {
    let secs = elapsed.as_secs_f64();
    if secs <= MIN_ELAPSED_S {
        return 0.0;
    }
    ((1.0 / secs) * 100.0).round() as f32 / 100.0
}

impl DetectionSet {
    pub(crate) fn frame_rate(&self) -> f32 {
        instantaneous_rate(self.processed_at.saturating_duration_since(self.captured_at))
    }
}

/// Summary returned when a detection task exits.
#[derive(Debug)]
pub(crate) struct CameraReport {
    pub(crate) camera: Arc<str>,
    pub(crate) frames_processed: u64,
    pub(crate) detector_errors: u64,
    pub(crate) source_exit: SourceExit,
}

pub(crate) struct DetectionTask {
    pub(crate) camera: Arc<str>,
    pub(crate) camera_index: usize,
    pub(crate) config: Arc<VisionConfig>,
    pub(crate) frames: LatestReceiver<Frame>,
    pub(crate) source: JoinHandle<SourceExit>,
    pub(crate) detector: Arc<dyn ObjectDetector>,
    pub(crate) link: Option<Arc<TelemetryLink>>,
    pub(crate) snapshots: Option<SnapshotSubmitter>,
    pub(crate) hub: Arc<StreamHub>,
    pub(crate) display: Option<LatestSender<AnnotatedFrame>>,
    pub(crate) shutdown: ShutdownToken,
    pub(crate) health: Arc<CameraHealth>,
}

/// Mutable per-task counters.
struct TaskState {
    frames_processed: u64,
    detector_errors: u64,
    gate: Option<SnapshotGate>,
}

impl DetectionTask {
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<CameraReport>> {
        let name = format!("vision-detect-{}", self.camera);
        telemetry::spawn_thread(name, move || self.run())
    }

    fn run(self) -> CameraReport {
        let span = tracing::info_span!("detection.worker", camera = %self.camera);
        let _guard = span.enter();

        let wait = self.config.processing.wait_timeout;
        let mut state = TaskState {
            frames_processed: 0,
            detector_errors: 0,
            gate: self
                .config
                .snapshots
                .as_ref()
                .filter(|_| self.snapshots.is_some())
                .map(|options| SnapshotGate::starting_at(options.interval, Instant::now())),
        };

        loop {
            if self.shutdown.is_requested() {
                debug!("shutdown requested");
                break;
            }
            match self.frames.recv_timeout(wait) {
                Ok(frame) => {
                    self.health.beat(Stage::Detection);
                    self.process(frame, &mut state);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.health.beat(Stage::Detection);
                    if self.source.is_finished() {
                        debug!("capture thread finished without closing its slot");
                        break;
                    }
                    debug!(wait_ms = wait.as_millis() as u64, "no frame within wait timeout");
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("capture slot closed");
                    break;
                }
            }
        }

        self.health.retire(Stage::Detection);
        let DetectionTask {
            camera,
            source,
            frames,
            display,
            snapshots,
            ..
        } = self;
        drop(display);
        drop(snapshots);
        drop(frames);
        let source_exit = source.join().unwrap_or_else(|_| {
            error!("Capture thread panicked");
            SourceExit::Panicked
        });

        info!(
            frames = state.frames_processed,
            detector_errors = state.detector_errors,
            ?source_exit,
            "Detection task finished"
        );
        CameraReport {
            camera,
            frames_processed: state.frames_processed,
            detector_errors: state.detector_errors,
            source_exit,
        }
    }

    fn process(&self, frame: Frame, state: &mut TaskState) {
        let frame_number = state.frames_processed + 1;
        let frame_span = tracing::debug_span!("detection.frame", frame = frame_number);
        let _frame_guard = frame_span.enter();

        let infer_start = Instant::now();
        let detections = match self.detector.detect(&frame.data, frame.width, frame.height) {
            Ok(detections) => detections,
            Err(err) => {
                state.detector_errors += 1;
                metrics::counter!("vision_detector_errors_total", "camera" => self.camera.to_string())
                    .increment(1);
                warn!(frame = frame_number, "Detector failed, skipping frame: {err:#}");
                return;
            }
        };
        metrics::histogram!("vision_detection_seconds", "camera" => self.camera.to_string())
            .record(infer_start.elapsed().as_secs_f64());

        let set = DetectionSet {
            detections,
            timestamp_ms: frame.timestamp_ms,
            captured_at: frame.captured_at,
            processed_at: Instant::now(),
        };
        let fps = set.frame_rate();
        if self.config.verbose {
            log_detections(frame_number, &set.detections);
        }

        let summaries = self.summarise(&set.detections, &frame);
        let image = match annotate_frame(&frame, &summaries, &self.camera, fps) {
            Ok(image) => image,
            Err(err) => {
                warn!(frame = frame_number, "Overlay failed, skipping frame: {err:#}");
                return;
            }
        };
        drop(frame);
        state.frames_processed = frame_number;

        if let Some(link) = &self.link {
            let camera = &self.config.cameras[self.camera_index];
            let geometry = CameraGeometry {
                width: image.width() as f32,
                height: image.height() as f32,
                hfov_deg: camera.hfov_deg,
                vfov_deg: camera.vfov_deg,
            };
            let records = telemetry_frames(
                &set.detections,
                &geometry,
                self.config.processing.tracked_classes,
                self.config.processing.confidence_floor,
                set.captured_at,
                Instant::now(),
            );
            link.send(&self.camera, &records);
        }

        if let (Some(gate), Some(submitter)) = (state.gate.as_mut(), self.snapshots.as_ref()) {
            if gate.try_claim(Instant::now()) {
                submitter.submit(SnapshotRequest {
                    camera: self.camera.clone(),
                    kind: SnapshotKind::Interval,
                    frame_number,
                    timestamp_ms: set.timestamp_ms,
                    detections: summaries.clone(),
                    payload: SnapshotPayload::Image(image.clone()),
                });
            }
        }

        match encode_jpeg(&image, self.config.processing.jpeg_quality) {
            Ok(jpeg) => {
                self.hub.publish(
                    &self.camera,
                    FramePacket {
                        jpeg,
                        detections: summaries,
                        timestamp_ms: set.timestamp_ms,
                        frame_number,
                        fps,
                    },
                );
            }
            Err(err) => warn!(frame = frame_number, "Stream encode failed: {err:#}"),
        }

        if let Some(display) = &self.display {
            display.publish(AnnotatedFrame {
                stream: self.camera.clone(),
                image,
                timestamp_ms: set.timestamp_ms,
                frame_number,
            });
        }
        metrics::counter!("vision_frames_processed_total", "camera" => self.camera.to_string())
            .increment(1);
    }

    /// Convert detections into clamped corner boxes with display labels.
    fn summarise(&self, detections: &[Detection], frame: &Frame) -> Vec<DetectionSummary> {
        let max_x = (frame.width - 1).max(0) as f32;
        let max_y = (frame.height - 1).max(0) as f32;
        detections
            .iter()
            .map(|det| {
                let [left, top, right, bottom] = det.corners();
                let class = self
                    .detector
                    .class_name(det.class_id)
                    .map(str::to_owned)
                    .unwrap_or_else(|| self.config.class_label(det.class_id));
                DetectionSummary {
                    class,
                    class_id: det.class_id,
                    score: det.score,
                    bbox: [
                        left.clamp(0.0, max_x),
                        top.clamp(0.0, max_y),
                        right.clamp(0.0, max_x),
                        bottom.clamp(0.0, max_y),
                    ],
                }
            })
            .collect()
    }
}

fn log_detections(frame_number: u64, detections: &[Detection]) {
    if detections.is_empty() {
        debug!("frame #{frame_number}: no detections");
        return;
    }
    debug!("frame #{frame_number}: {} detection(s)", detections.len());
    for (idx, det) in detections.iter().enumerate() {
        debug!(
            "  #{idx}: class={} conf={:.3} bbox={:?}",
            det.class_id, det.score, det.bbox_xywh
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_reciprocal_of_elapsed() {
        assert_eq!(instantaneous_rate(Duration::from_millis(100)), 10.0);
        assert_eq!(instantaneous_rate(Duration::from_millis(30)), 33.33);
    }

    #[test]
    fn rate_is_zero_for_vanishing_elapsed() {
        assert_eq!(instantaneous_rate(Duration::ZERO), 0.0);
        assert_eq!(instantaneous_rate(Duration::from_nanos(500)), 0.0);
    }

    #[test]
    fn detection_set_rate_uses_capture_to_processing_time() {
        let captured_at = Instant::now();
        let set = DetectionSet {
            detections: Vec::new(),
            timestamp_ms: 0,
            captured_at,
            processed_at: captured_at + Duration::from_millis(250),
        };
        assert_eq!(set.frame_rate(), 4.0);
        let reversed = DetectionSet {
            processed_at: captured_at,
            captured_at: captured_at + Duration::from_millis(5),
            ..set
        };
        assert_eq!(reversed.frame_rate(), 0.0);
    }
}
