//! Rate-limited persistence of annotated frames.
//!
//! Detection tasks consult a per-camera [`SnapshotGate`] and hand admitted
//! frames to the [`SnapshotScheduler`], whose single worker thread writes a
//! JPEG and a JSON sidecar per snapshot:
//!
//! ```text
//! <dir>/<camera>/<YYYYmmdd-HHMMSS-mmm>-<frame>.jpg
//! <dir>/<camera>/<YYYYmmdd-HHMMSS-mmm>-<frame>.json
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use actix_web::web::Bytes;
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::RecvTimeoutError;
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::vision::{
    config::SnapshotOptions,
    data::DetectionSummary,
    encoding::encode_jpeg,
    handoff::{LatestReceiver, LatestSender, Publish, bounded_latest},
    telemetry,
};

const WORKER_POLL: Duration = Duration::from_millis(250);

/// Admits at most one snapshot per interval for one camera.
#[derive(Debug)]
pub(crate) struct SnapshotGate {
    interval: Duration,
    last: Instant,
}

impl SnapshotGate {
    /// The first snapshot is admitted one full interval after `start`.
    pub(crate) fn starting_at(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last: start,
        }
    }

    /// Claim the slot if strictly more than one interval has elapsed.
    pub(crate) fn try_claim(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) > self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SnapshotKind {
    /// Admitted by the per-camera interval gate.
    Interval,
    /// Requested by the ground station.
    Manual,
}

pub(crate) enum SnapshotPayload {
    Image(RgbImage),
    Jpeg(Bytes),
}

pub(crate) struct SnapshotRequest {
    pub(crate) camera: Arc<str>,
    pub(crate) kind: SnapshotKind,
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) payload: SnapshotPayload,
}

#[derive(Serialize)]
struct SnapshotMetadata<'a> {
    camera: &'a str,
    kind: SnapshotKind,
    frame_number: u64,
    timestamp_ms: i64,
    captured_at: String,
    image: &'a str,
    detections: &'a [DetectionSummary],
}

/// Non-blocking handle used by detection tasks and the command dispatcher.
#[derive(Clone)]
pub(crate) struct SnapshotSubmitter {
    tx: LatestSender<SnapshotRequest>,
}

impl SnapshotSubmitter {
    /// Queue a snapshot, dropping the oldest pending one if the queue is full.
    pub(crate) fn submit(&self, request: SnapshotRequest) {
        let camera = request.camera.clone();
        if self.tx.publish(request) == Publish::Replaced {
            metrics::counter!("vision_snapshots_dropped_total").increment(1);
            debug!(camera = %camera, "snapshot queue full, dropped oldest request");
        }
        metrics::gauge!("vision_queue_depth", "queue" => "snapshots").set(self.tx.len() as f64);
    }
}

/// Submitter whose queue is read directly by the caller instead of a worker.
#[cfg(test)]
pub(crate) fn detached_submitter(
    capacity: usize,
) -> (SnapshotSubmitter, LatestReceiver<SnapshotRequest>) {
    let (tx, rx) = bounded_latest(capacity);
    (SnapshotSubmitter { tx }, rx)
}

/// Owns the snapshot worker thread.
pub(crate) struct SnapshotScheduler {
    submitter: Option<SnapshotSubmitter>,
    worker: Option<JoinHandle<()>>,
}

impl SnapshotScheduler {
    pub(crate) fn spawn(options: &SnapshotOptions, jpeg_quality: u8) -> Result<Self> {
        fs::create_dir_all(&options.directory).with_context(|| {
            format!(
                "Failed to create snapshot directory {}",
                options.directory.display()
            )
        })?;
        let (tx, rx) = bounded_latest(options.queue_capacity);
        let directory = options.directory.clone();
        let worker = telemetry::spawn_thread("vision-snapshots", move || {
            run_worker(rx, &directory, jpeg_quality)
        })
        .context("Failed to spawn snapshot worker")?;
        info!(
            directory = %options.directory.display(),
            interval_s = options.interval.as_secs_f64(),
            "Snapshot scheduler started"
        );
        Ok(Self {
            submitter: Some(SnapshotSubmitter { tx }),
            worker: Some(worker),
        })
    }

    pub(crate) fn submitter(&self) -> Option<SnapshotSubmitter> {
        self.submitter.clone()
    }

    /// Drop the scheduler's sender and wait for pending snapshots to be
    /// written. Returns once every other submitter has been dropped too.
    pub(crate) fn shutdown(mut self) {
        self.submitter.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Snapshot worker panicked");
            }
        }
    }
}

fn run_worker(rx: LatestReceiver<SnapshotRequest>, directory: &Path, jpeg_quality: u8) {
    let span = tracing::info_span!("snapshots.worker", directory = %directory.display());
    let _guard = span.enter();
    loop {
        match rx.recv_timeout(WORKER_POLL) {
            Ok(request) => match write_snapshot(directory, &request, jpeg_quality) {
                Ok(path) => {
                    metrics::counter!("vision_snapshots_written_total").increment(1);
                    info!(
                        camera = %request.camera,
                        kind = ?request.kind,
                        path = %path.display(),
                        "Snapshot saved"
                    );
                }
                Err(err) => {
                    metrics::counter!("vision_snapshots_failed_total").increment(1);
                    error!(camera = %request.camera, "Snapshot failed: {err:#}");
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("snapshot worker exiting");
}

fn write_snapshot(directory: &Path, request: &SnapshotRequest, jpeg_quality: u8) -> Result<PathBuf> {
    let camera_dir = directory.join(&*request.camera);
    fs::create_dir_all(&camera_dir)
        .with_context(|| format!("Failed to create {}", camera_dir.display()))?;

    let captured = chrono::DateTime::from_timestamp_millis(request.timestamp_ms)
        .ok_or_else(|| anyhow!("timestamp {} out of range", request.timestamp_ms))?;
    let stem = format!(
        "{}-{:06}",
        captured.format("%Y%m%d-%H%M%S-%3f"),
        request.frame_number
    );

    let jpeg = match &request.payload {
        SnapshotPayload::Image(image) => encode_jpeg(image, jpeg_quality)?,
        SnapshotPayload::Jpeg(bytes) => bytes.clone(),
    };
    let image_name = format!("{stem}.jpg");
    let image_path = camera_dir.join(&image_name);
    fs::write(&image_path, &jpeg)
        .with_context(|| format!("Failed to write {}", image_path.display()))?;

    let metadata = SnapshotMetadata {
        camera: &request.camera,
        kind: request.kind,
        frame_number: request.frame_number,
        timestamp_ms: request.timestamp_ms,
        captured_at: captured.to_rfc3339(),
        image: &image_name,
        detections: &request.detections,
    };
    let meta_path = camera_dir.join(format!("{stem}.json"));
    let json = serde_json::to_vec_pretty(&metadata).context("Failed to serialise metadata")?;
    fs::write(&meta_path, json)
        .with_context(|| format!("Failed to write {}", meta_path.display()))?;

    Ok(image_path)
}
