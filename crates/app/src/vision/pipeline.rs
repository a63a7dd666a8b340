//! Pipeline supervisor tying together capture, detection, telemetry,
//! snapshots, the stream server and the display.
//!
//! The supervisor runs on the calling thread. It owns every handle, pumps the
//! display and ground-station commands while the cameras run, and on shutdown
//! tears stages down in dependency order so every thread is joined and every
//! device is released exactly once.

use std::{
    net::SocketAddr,
    sync::{Arc, Once},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use ml_core::{NullDetector, ObjectDetector};
use tracing::{error, info, warn};
use video_ingest::{DeviceOpener, FfmpegOpener};

use crate::vision::{
    VisionConfig,
    commands::CommandDispatcher,
    display::{DisplayAggregator, DisplaySink},
    handoff::slot,
    link::TelemetryLink,
    processing::{CameraReport, DetectionTask},
    server::StreamServer,
    shutdown::ShutdownToken,
    snapshot::SnapshotScheduler,
    source::{FrameSource, SourceExit},
    stream::StreamHub,
    telemetry,
    watchdog::{CameraHealth, spawn_watchdog},
};

const SUPERVISOR_TICK: Duration = Duration::from_millis(20);

/// Outcome of a pipeline run.
#[derive(Debug)]
pub(crate) struct PipelineReport {
    pub(crate) cameras: Vec<CameraReport>,
    pub(crate) stream_addr: Option<SocketAddr>,
}

/// Collaborators the pipeline is assembled from.
pub(crate) struct Collaborators {
    pub(crate) detector: Arc<dyn ObjectDetector>,
    pub(crate) opener: Arc<dyn DeviceOpener>,
    pub(crate) display: Option<Box<dyn DisplaySink>>,
}

/// Run the vision pipeline until every camera finishes or the process is
/// interrupted.
pub fn run(config: VisionConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry, config.verbose);
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("Prometheus metrics unavailable: {err:#}");
    }

    let shutdown = ShutdownToken::new();
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || handler_shutdown.request()) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let collaborators = Collaborators {
        detector: build_detector(&config)?,
        opener: capture_opener(config.width, config.height, config.detector.use_nvdec),
        display: build_display(&config),
    };

    let report = run_with(config, collaborators, shutdown)?;
    if let Some(addr) = report.stream_addr {
        info!(%addr, "Stream server closed");
    }
    for camera in &report.cameras {
        info!(
            camera = %camera.camera,
            frames = camera.frames_processed,
            detector_errors = camera.detector_errors,
            source_exit = ?camera.source_exit,
            "Camera summary"
        );
    }
    let failed = report
        .cameras
        .iter()
        .filter(|camera| {
            matches!(
                camera.source_exit,
                SourceExit::OpenFailed | SourceExit::ReadFailed | SourceExit::Panicked
            )
        })
        .count();
    if failed > 0 {
        warn!(failed, "Some cameras stopped because of device errors");
    }
    Ok(())
}

/// Assemble and supervise the pipeline with explicit collaborators.
pub(crate) fn run_with(
    config: VisionConfig,
    collaborators: Collaborators,
    shutdown: ShutdownToken,
) -> Result<PipelineReport> {
    let config = Arc::new(config);
    let pipeline_span = tracing::info_span!(
        "vision.pipeline",
        cameras = config.cameras.len(),
        width = config.width,
        height = config.height,
    );
    let _pipeline_guard = pipeline_span.enter();

    let names: Vec<Arc<str>> = config
        .cameras
        .iter()
        .map(|camera| Arc::from(camera.name.as_str()))
        .collect();
    let hub = Arc::new(StreamHub::new(names.iter().cloned()));

    let snapshots = config
        .snapshots
        .as_ref()
        .map(|options| SnapshotScheduler::spawn(options, config.processing.jpeg_quality))
        .transpose()
        .context("Failed to start snapshot scheduler")?;

    let server = match config.stream.as_ref() {
        Some(options) => match StreamServer::start(hub.clone(), options, shutdown.clone()) {
            Ok(server) => Some(server),
            Err(err) => {
                if let Some(snapshots) = snapshots {
                    snapshots.shutdown();
                }
                return Err(err.context("Failed to start stream server"));
            }
        },
        None => None,
    };
    let stream_addr = server.as_ref().map(StreamServer::local_addr);
    if let Some(addr) = stream_addr {
        for name in &names {
            info!("Stream {name} available at http://{addr}/{name}/stream.mjpg");
        }
    }

    let link = config.link.as_ref().map(|options| {
        let link = Arc::new(TelemetryLink::new(options));
        info!(destination = %options.target, "Sending MAVLink telemetry");
        if let Some(addr) = link.inbound_addr() {
            info!(%addr, "Listening for ground-station commands");
        }
        link
    });

    let mut aggregator = collaborators.display.map(DisplayAggregator::new);

    let mut workers: Vec<JoinHandle<CameraReport>> = Vec::with_capacity(config.cameras.len());
    let mut healths = Vec::with_capacity(config.cameras.len());
    for (camera_index, (camera, name)) in config.cameras.iter().zip(&names).enumerate() {
        let health = Arc::new(CameraHealth::new(name.clone()));
        let (frames_tx, frames_rx) = slot();
        let source = FrameSource {
            camera: name.clone(),
            uri: camera.source.clone(),
            opener: collaborators.opener.clone(),
            frames: frames_tx,
            shutdown: shutdown.clone(),
            health: health.clone(),
        }
        .spawn();
        let source = match source {
            Ok(handle) => handle,
            Err(err) => {
                error!(camera = %name, "Failed to spawn capture thread: {err}");
                continue;
            }
        };

        let task = DetectionTask {
            camera: name.clone(),
            camera_index,
            config: config.clone(),
            frames: frames_rx,
            source,
            detector: collaborators.detector.clone(),
            link: link.clone(),
            snapshots: snapshots.as_ref().and_then(SnapshotScheduler::submitter),
            hub: hub.clone(),
            display: aggregator.as_mut().map(DisplayAggregator::attach),
            shutdown: shutdown.clone(),
            health: health.clone(),
        };
        match task.spawn() {
            Ok(handle) => {
                workers.push(handle);
                healths.push(health);
            }
            Err(err) => error!(camera = %name, "Failed to spawn detection thread: {err}"),
        }
    }

    let watchdog = match spawn_watchdog(
        healths,
        shutdown.clone(),
        config.processing.wait_timeout,
    ) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Failed to spawn watchdog: {err}");
            None
        }
    };

    let mut dispatcher = CommandDispatcher::new(
        hub.clone(),
        snapshots.as_ref().and_then(SnapshotScheduler::submitter),
        config.snapshots.as_ref().map(|options| options.directory.clone()),
        config.on_generate.clone(),
    );

    info!(cameras = workers.len(), "Vision pipeline running, press Ctrl+C to stop");
    loop {
        if shutdown.is_requested() {
            info!("Shutdown requested");
            break;
        }
        if workers.iter().all(JoinHandle::is_finished) {
            info!("All cameras finished");
            break;
        }
        if let Some(signal) = link.as_ref().and_then(|link| link.poll_command()) {
            dispatcher.dispatch(signal);
        }
        dispatcher.reap();
        if let Some(aggregator) = aggregator.as_mut() {
            if aggregator.pump() {
                info!("Display closed, shutting down");
                shutdown.request();
            }
        }
        thread::sleep(SUPERVISOR_TICK);
    }

    shutdown.request();
    if let Some(link) = &link {
        link.close();
    }

    let mut cameras = Vec::with_capacity(workers.len());
    for worker in workers {
        match worker.join() {
            Ok(report) => cameras.push(report),
            Err(_) => error!("Detection thread panicked"),
        }
    }

    if let Some(server) = server {
        server.stop();
    }
    if let Some(aggregator) = aggregator.as_mut() {
        aggregator.close();
    }
    dispatcher.shutdown();
    drop(dispatcher);
    if let Some(snapshots) = snapshots {
        snapshots.shutdown();
    }
    if let Some(watchdog) = watchdog {
        if watchdog.join().is_err() {
            error!("Watchdog thread panicked");
        }
    }
    info!("Vision pipeline stopped");

    Ok(PipelineReport {
        cameras,
        stream_addr,
    })
}

/// Capture backend for the current build. NVDEC always goes through ffmpeg.
#[cfg(feature = "opencv")]
pub(crate) fn capture_opener(width: i32, height: i32, use_nvdec: bool) -> Arc<dyn DeviceOpener> {
    if use_nvdec {
        Arc::new(FfmpegOpener::new((width, height)).with_hwaccel(true))
    } else {
        Arc::new(video_ingest::OpenCvOpener::new((width, height)))
    }
}

/// Capture backend for the current build.
#[cfg(not(feature = "opencv"))]
pub(crate) fn capture_opener(width: i32, height: i32, use_nvdec: bool) -> Arc<dyn DeviceOpener> {
    Arc::new(FfmpegOpener::new((width, height)).with_hwaccel(use_nvdec))
}

#[cfg(feature = "with-tch")]
fn build_detector(config: &VisionConfig) -> Result<Arc<dyn ObjectDetector>> {
    use ml_core::{detector::TorchDetector, tch::Device};

    let Some(model_path) = config.detector.model_path.as_ref() else {
        warn!("No --model given; frames pass through without detections");
        return Ok(Arc::new(NullDetector));
    };
    let device = if config.detector.use_cpu {
        Device::Cpu
    } else {
        crate::vision::runtime::load_torch_cuda_runtime();
        Device::cuda_if_available()
    };
    let detector = TorchDetector::new(
        model_path,
        device,
        (
            i64::from(config.detector.input_width),
            i64::from(config.detector.input_height),
        ),
    )
    .with_context(|| format!("Failed to load detector from {}", model_path.display()))?
    .with_iou_threshold(config.detector.iou_threshold)
    .with_labels(config.detector.labels.clone());
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn build_detector(config: &VisionConfig) -> Result<Arc<dyn ObjectDetector>> {
    if config.detector.model_path.is_some() {
        warn!("Built without the with-tch feature; ignoring --model");
    } else {
        warn!("No --model given; frames pass through without detections");
    }
    Ok(Arc::new(NullDetector))
}

fn build_display(config: &VisionConfig) -> Option<Box<dyn DisplaySink>> {
    if !config.display {
        return None;
    }
    #[cfg(feature = "highgui")]
    {
        Some(Box::new(crate::vision::display::HighGuiSink::default()))
    }
    #[cfg(not(feature = "highgui"))]
    {
        warn!("--display needs the highgui feature; running headless");
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpStream, UdpSocket},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Instant,
    };

    use anyhow::anyhow;
    use ml_core::Detection;
    use tempfile::TempDir;
    use video_ingest::{CaptureDevice, CaptureError, Frame, FrameFormat};

    use super::*;
    use crate::vision::{
        config::{
            CameraDescriptor, DetectorOptions, LinkOptions, ProcessingOptions, SnapshotOptions,
            StreamOptions, TelemetryOptions,
        },
        data::AnnotatedFrame,
    };

    const WIDTH: i32 = 64;
    const HEIGHT: i32 = 48;

    #[derive(Default)]
    struct DeviceLog {
        opened: AtomicUsize,
        released: AtomicUsize,
    }

    /// Synthetic camera: `"fail"` cannot be opened, `"short:N"` ends after N
    /// frames, anything else streams until released.
    struct FakeOpener {
        log: Arc<DeviceLog>,
    }

    struct FakeDevice {
        log: Arc<DeviceLog>,
        remaining: Option<u32>,
        released: bool,
    }

    impl DeviceOpener for FakeOpener {
        fn open(&self, source: &str) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            if source == "fail" {
                return Err(CaptureError::Open {
                    uri: source.to_string(),
                });
            }
            self.log.opened.fetch_add(1, Ordering::SeqCst);
            let remaining = source
                .strip_prefix("short:")
                .and_then(|n| n.parse().ok());
            Ok(Box::new(FakeDevice {
                log: self.log.clone(),
                remaining,
                released: false,
            }))
        }
    }

    impl CaptureDevice for FakeDevice {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            if let Some(remaining) = self.remaining.as_mut() {
                if *remaining == 0 {
                    return Ok(None);
                }
                *remaining -= 1;
            }
            thread::sleep(Duration::from_millis(5));
            Ok(Some(Frame {
                data: vec![80; (WIDTH * HEIGHT * 3) as usize],
                width: WIDTH,
                height: HEIGHT,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                captured_at: Instant::now(),
                format: FrameFormat::Bgr8,
            }))
        }

        fn release(&mut self) {
            if !self.released {
                self.released = true;
                self.log.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Reports one class-0 box right of centre; fails every `fail_every`th call.
    struct FakeDetector {
        calls: AtomicUsize,
        fail_every: usize,
    }

    impl ObjectDetector for FakeDetector {
        fn detect(&self, _bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && call % self.fail_every == 0 {
                return Err(anyhow!("synthetic detector failure"));
            }
            Ok(vec![Detection {
                bbox_xywh: [width as f32 * 0.75, height as f32 / 2.0, 8.0, 8.0],
                score: 0.9,
                class_id: 0,
            }])
        }
    }

    struct QuitAfterFirstFrame {
        shown: Arc<Mutex<Vec<u64>>>,
        closes: Arc<AtomicUsize>,
    }

    impl DisplaySink for QuitAfterFirstFrame {
        fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
            self.shown.lock().unwrap().push(frame.frame_number);
            Ok(())
        }

        fn poll_quit(&mut self) -> bool {
            !self.shown.lock().unwrap().is_empty()
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config(sources: &[&str], snapshot_dir: &TempDir, mavlink: Option<SocketAddr>) -> VisionConfig {
        VisionConfig {
            cameras: sources
                .iter()
                .enumerate()
                .map(|(idx, source)| CameraDescriptor {
                    name: format!("cam{idx}"),
                    source: source.to_string(),
                    hfov_deg: 60.0,
                    vfov_deg: 45.0,
                })
                .collect(),
            width: WIDTH,
            height: HEIGHT,
            detector: DetectorOptions {
                model_path: None,
                use_cpu: true,
                use_nvdec: false,
                input_width: WIDTH,
                input_height: HEIGHT,
                iou_threshold: 0.45,
                labels: vec!["target".into()],
            },
            processing: ProcessingOptions {
                confidence_floor: 0.5,
                tracked_classes: 2,
                wait_timeout: Duration::from_millis(300),
                jpeg_quality: 50,
            },
            stream: Some(StreamOptions {
                bind: "127.0.0.1:0".parse().unwrap(),
                fps: 20,
            }),
            snapshots: Some(SnapshotOptions {
                directory: snapshot_dir.path().to_path_buf(),
                interval: Duration::from_millis(50),
                queue_capacity: 4,
            }),
            link: mavlink.map(|addr| LinkOptions {
                target: addr.to_string(),
                listen_port: None,
                system_id: 255,
                component_id: 0,
            }),
            display: false,
            on_generate: None,
            verbose: true,
            telemetry: TelemetryOptions::default(),
        }
    }

    fn collaborators(log: &Arc<DeviceLog>, fail_every: usize) -> Collaborators {
        Collaborators {
            detector: Arc::new(FakeDetector {
                calls: AtomicUsize::new(0),
                fail_every,
            }),
            opener: Arc::new(FakeOpener { log: log.clone() }),
            display: None,
        }
    }

    #[test]
    fn interrupt_mid_stream_joins_everything_and_releases_devices() {
        let dir = tempfile::tempdir().unwrap();
        let station = UdpSocket::bind("127.0.0.1:0").unwrap();
        station.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let config = test_config(&["0", "1"], &dir, Some(station.local_addr().unwrap()));
        let log = Arc::new(DeviceLog::default());
        let shutdown = ShutdownToken::new();

        let runner = {
            let log = log.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || run_with(config, collaborators(&log, 4), shutdown))
        };

        thread::sleep(Duration::from_millis(400));
        let requested_at = Instant::now();
        shutdown.request();
        let report = runner.join().unwrap().unwrap();
        assert!(requested_at.elapsed() < Duration::from_secs(3));

        assert_eq!(report.cameras.len(), 2);
        for camera in &report.cameras {
            assert_eq!(camera.source_exit, SourceExit::Shutdown);
            assert!(camera.frames_processed > 0);
        }
        assert!(report.cameras.iter().any(|camera| camera.detector_errors > 0));
        assert_eq!(log.opened.load(Ordering::SeqCst), 2);
        assert_eq!(log.released.load(Ordering::SeqCst), 2);

        let addr = report.stream_addr.unwrap();
        assert!(TcpStream::connect(addr).is_err());

        let mut buf = [0u8; 256];
        let len = station.recv(&mut buf).unwrap();
        assert_eq!(buf[0], 0xFE);
        assert!(len > 6);

        let cam0 = dir.path().join("cam0");
        assert!(std::fs::read_dir(cam0).unwrap().count() >= 2);
    }

    #[test]
    fn finite_sources_end_the_pipeline_on_their_own() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&["short:5", "short:3"], &dir, None);
        config.stream = None;
        let log = Arc::new(DeviceLog::default());
        let report = run_with(config, collaborators(&log, 0), ShutdownToken::new()).unwrap();

        assert_eq!(report.cameras.len(), 2);
        for camera in &report.cameras {
            assert_eq!(camera.source_exit, SourceExit::EndOfStream);
            assert!(camera.frames_processed >= 1);
        }
        assert!(report.cameras[0].frames_processed <= 5);
        assert!(report.cameras[1].frames_processed <= 3);
        assert_eq!(log.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_broken_camera_does_not_affect_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&["fail", "short:4"], &dir, None);
        config.snapshots = None;
        let log = Arc::new(DeviceLog::default());
        let report = run_with(config, collaborators(&log, 0), ShutdownToken::new()).unwrap();

        assert_eq!(report.cameras[0].source_exit, SourceExit::OpenFailed);
        assert_eq!(report.cameras[0].frames_processed, 0);
        assert_eq!(report.cameras[1].source_exit, SourceExit::EndOfStream);
        assert!(report.cameras[1].frames_processed >= 1);
    }

    #[test]
    fn display_quit_requests_shutdown_and_closes_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&["0"], &dir, None);
        config.display = true;
        config.snapshots = None;
        let log = Arc::new(DeviceLog::default());
        let shown = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut parts = collaborators(&log, 0);
        parts.display = Some(Box::new(QuitAfterFirstFrame {
            shown: shown.clone(),
            closes: closes.clone(),
        }));
        let shutdown = ShutdownToken::new();

        let report = run_with(config, parts, shutdown.clone()).unwrap();
        assert!(shutdown.is_requested());
        assert!(!shown.lock().unwrap().is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(report.cameras[0].source_exit, SourceExit::Shutdown);
        assert_eq!(log.released.load(Ordering::SeqCst), 1);
    }
}
