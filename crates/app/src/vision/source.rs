use std::{io, sync::Arc, thread::JoinHandle};

use tracing::{debug, error, info, warn};
use video_ingest::{DeviceOpener, Frame};

use crate::vision::{
    handoff::{LatestSender, Publish},
    shutdown::ShutdownToken,
    telemetry,
    watchdog::{CameraHealth, Stage},
};

/// Why a frame source stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceExit {
    EndOfStream,
    Shutdown,
    OpenFailed,
    ReadFailed,
    Panicked,
}

pub(crate) struct FrameSource {
    pub(crate) camera: Arc<str>,
    pub(crate) uri: String,
    pub(crate) opener: Arc<dyn DeviceOpener>,
    pub(crate) frames: LatestSender<Frame>,
    pub(crate) shutdown: ShutdownToken,
    pub(crate) health: Arc<CameraHealth>,
}

impl FrameSource {
    /// Start the capture loop on its own thread.
    ///
    /// The device is released before the thread exits and the slot sender is
    /// dropped with it, which the paired detection task observes as a
    /// disconnect.
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<SourceExit>> {
        let name = format!("vision-capture-{}", self.camera);
        telemetry::spawn_thread(name, move || self.run())
    }

    fn run(self) -> SourceExit {
        let span = tracing::info_span!("capture.worker", camera = %self.camera, uri = %self.uri);
        let _guard = span.enter();

        let mut device = match self.opener.open(&self.uri) {
            Ok(device) => device,
            Err(err) => {
                error!("Failed to open camera: {err}");
                self.health.retire(Stage::Capture);
                return SourceExit::OpenFailed;
            }
        };
        info!("Camera opened");

        let mut captured: u64 = 0;
        let exit = loop {
            if self.shutdown.is_requested() {
                break SourceExit::Shutdown;
            }
            match device.read_frame() {
                Ok(Some(frame)) => {
                    captured += 1;
                    self.health.beat(Stage::Capture);
                    metrics::counter!("vision_frames_captured_total", "camera" => self.camera.to_string())
                        .increment(1);
                    if self.frames.publish(frame) == Publish::Replaced {
                        metrics::counter!("vision_frames_replaced_total", "camera" => self.camera.to_string())
                            .increment(1);
                        debug!(frame = captured, "detection behind, replaced pending frame");
                    }
                }
                Ok(None) => {
                    info!(frames = captured, "Camera reached end of stream");
                    break SourceExit::EndOfStream;
                }
                Err(err) => {
                    warn!(frames = captured, "Camera read failed: {err}");
                    break SourceExit::ReadFailed;
                }
            }
        };

        device.release();
        self.health.retire(Stage::Capture);
        debug!(?exit, "capture loop finished");
        exit
    }
}
