//! Configuration parsing for the vision pipeline.
//!
//! CLI flags (with environment fallbacks for the MAVLink endpoints) and an
//! optional TOML camera registry are folded into one validated
//! [`VisionConfig`] that downstream stages use without re-parsing anything.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use serde::Deserialize;

/// Fallback field of view used when a camera does not declare its own.
pub(crate) const DEFAULT_HFOV_DEG: f32 = 60.0;
pub(crate) const DEFAULT_VFOV_DEG: f32 = 45.0;

#[derive(Clone, Debug, PartialEq)]
/// One entry in the camera registry. Each descriptor gets its own capture and
/// detection thread and its own named sub-stream.
pub struct CameraDescriptor {
    /// Stream and log name, unique across the registry.
    pub name: String,
    /// Device index, `/dev/videoN`, file path or network URI.
    pub source: String,
    /// Horizontal field of view in degrees.
    pub hfov_deg: f32,
    /// Vertical field of view in degrees.
    pub vfov_deg: f32,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct VisionConfig {
    pub cameras: Vec<CameraDescriptor>,
    /// Capture width delivered by the ingest backend.
    pub width: i32,
    /// Capture height delivered by the ingest backend.
    pub height: i32,
    pub detector: DetectorOptions,
    pub processing: ProcessingOptions,
    pub stream: Option<StreamOptions>,
    pub snapshots: Option<SnapshotOptions>,
    pub link: Option<LinkOptions>,
    /// Forward annotated frames to the main-thread display.
    pub display: bool,
    /// Shell command run when the ground station asks for map generation.
    pub on_generate: Option<String>,
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
pub struct DetectorOptions {
    /// TorchScript model; without one frames pass through with no detections.
    pub model_path: Option<PathBuf>,
    pub use_cpu: bool,
    pub use_nvdec: bool,
    pub input_width: i32,
    pub input_height: i32,
    pub iou_threshold: f32,
    pub labels: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ProcessingOptions {
    /// A detection must score strictly above this to count for telemetry.
    pub confidence_floor: f32,
    /// Class ids `0..tracked_classes` are reported over telemetry.
    pub tracked_classes: u8,
    /// Bounded wait on the capture slot before re-checking liveness.
    pub wait_timeout: Duration,
    /// JPEG quality used for the stream and snapshots.
    pub jpeg_quality: u8,
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub bind: SocketAddr,
    pub fps: u32,
}

#[derive(Clone, Debug)]
pub struct SnapshotOptions {
    pub directory: PathBuf,
    pub interval: Duration,
    pub queue_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct LinkOptions {
    /// `host:port` the MAVLink scalars are sent to.
    pub target: String,
    /// UDP port listened on for inbound status text.
    pub listen_port: Option<u16>,
    pub system_id: u8,
    pub component_id: u8,
}

#[derive(Clone, Debug, Default)]
/// Tracing output knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Camera source (index, /dev/videoN, file or URI). Repeat for several cameras.
    #[arg(long = "camera", value_name = "SOURCE")]
    pub cameras: Vec<String>,
    /// TOML camera registry with per-camera names and fields of view.
    #[arg(long = "cameras-file", value_name = "PATH")]
    pub cameras_file: Option<PathBuf>,
    /// Capture width in pixels.
    #[arg(long, value_name = "PX", default_value_t = 640)]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(long, value_name = "PX", default_value_t = 480)]
    pub height: i32,
    /// Default horizontal field of view in degrees.
    #[arg(long, value_name = "DEG", default_value_t = DEFAULT_HFOV_DEG)]
    pub hfov: f32,
    /// Default vertical field of view in degrees.
    #[arg(long, value_name = "DEG", default_value_t = DEFAULT_VFOV_DEG)]
    pub vfov: f32,

    /// TorchScript model path.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue, conflicts_with = "use_nvdec")]
    pub use_cpu: bool,
    /// Decode H.264 sources through NVDEC.
    #[arg(long = "nvdec", action = clap::ArgAction::SetTrue)]
    pub use_nvdec: bool,
    /// Detector input width in pixels.
    #[arg(long = "detector-width", value_name = "PX", default_value_t = 640)]
    pub detector_width: i32,
    /// Detector input height in pixels.
    #[arg(long = "detector-height", value_name = "PX", default_value_t = 640)]
    pub detector_height: i32,
    /// IoU threshold for non-maximum suppression.
    #[arg(long = "iou", value_name = "RATIO", default_value_t = 0.45)]
    pub iou: f32,
    /// Comma separated class names, index = class id.
    #[arg(long = "labels", value_name = "NAMES", value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Minimum confidence (exclusive) for a detection to be reported.
    #[arg(long = "confidence", value_name = "RATIO", default_value_t = 0.5)]
    pub confidence: f32,
    /// Number of class ids reported over telemetry.
    #[arg(long = "tracked-classes", value_name = "N", default_value_t = 2)]
    pub tracked_classes: u8,
    /// Bounded wait for a frame before re-checking the capture thread.
    #[arg(long = "wait-timeout-ms", value_name = "MS", default_value_t = 5_000)]
    pub wait_timeout_ms: u64,
    /// JPEG quality used by the stream and snapshots (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 50)]
    pub jpeg_quality: u8,

    /// Address the MJPEG server listens on.
    #[arg(long = "stream-bind", value_name = "ADDR", default_value = "0.0.0.0:5090")]
    pub stream_bind: SocketAddr,
    /// Frames per second served to each stream client.
    #[arg(long = "stream-fps", value_name = "FPS", default_value_t = 10)]
    pub stream_fps: u32,
    /// Disable the MJPEG server.
    #[arg(long = "no-stream", action = clap::ArgAction::SetTrue)]
    pub no_stream: bool,

    /// Directory snapshots are written to.
    #[arg(long = "snapshot-dir", value_name = "PATH", default_value = "snapshots")]
    pub snapshot_dir: PathBuf,
    /// Minimum seconds between two snapshots of the same camera.
    #[arg(long = "snapshot-interval", value_name = "SECS", default_value_t = 10.0)]
    pub snapshot_interval: f64,
    /// Pending snapshot requests kept before the oldest is dropped.
    #[arg(long = "snapshot-queue", value_name = "N", default_value_t = 4)]
    pub snapshot_queue: usize,
    /// Disable snapshots.
    #[arg(long = "no-snapshots", action = clap::ArgAction::SetTrue)]
    pub no_snapshots: bool,

    /// Host receiving MAVLink telemetry.
    #[arg(long = "mavlink-host", env = "MAVLINK_TARGET_HOST", default_value = "127.0.0.1")]
    pub mavlink_host: String,
    /// Port receiving MAVLink telemetry.
    #[arg(long = "mavlink-port", env = "MAVLINK_TARGET_PORT", default_value_t = 14550)]
    pub mavlink_port: u16,
    /// Local UDP port listening for ground-station status text (0 disables).
    #[arg(long = "mavlink-listen-port", env = "MAVLINK_LISTEN_PORT", default_value_t = 14551)]
    pub mavlink_listen_port: u16,
    /// MAVLink system id stamped on outgoing frames.
    #[arg(long = "system-id", default_value_t = 255)]
    pub system_id: u8,
    /// MAVLink component id stamped on outgoing frames.
    #[arg(long = "component-id", default_value_t = 0)]
    pub component_id: u8,
    /// Disable MAVLink telemetry.
    #[arg(long = "no-mavlink", action = clap::ArgAction::SetTrue)]
    pub no_mavlink: bool,

    /// Show annotated frames in local windows.
    #[arg(long = "display", action = clap::ArgAction::SetTrue)]
    pub display: bool,
    /// Shell command run when the ground station requests map generation.
    #[arg(long = "on-generate", value_name = "COMMAND")]
    pub on_generate: Option<String>,
    /// Enable verbose logging (per-frame detections, frame drops).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

/// On-disk camera registry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CameraFile {
    #[serde(rename = "camera", default)]
    cameras: Vec<CameraEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CameraEntry {
    name: Option<String>,
    source: String,
    hfov: Option<f32>,
    vfov: Option<f32>,
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }
        if args.detector_width <= 0 || args.detector_height <= 0 {
            bail!("Detector dimensions must be positive integers");
        }
        validate_fov(args.hfov, "--hfov")?;
        validate_fov(args.vfov, "--vfov")?;
        if !(0.0..1.0).contains(&args.confidence) {
            bail!("--confidence must be in [0, 1)");
        }
        if !(0.0..=1.0).contains(&args.iou) {
            bail!("--iou must be in [0, 1]");
        }
        if args.tracked_classes == 0 {
            bail!("--tracked-classes must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.wait_timeout_ms == 0 {
            bail!("--wait-timeout-ms must be positive");
        }

        let mut cameras = match args.cameras_file.as_deref() {
            Some(path) => load_camera_file(path, args.hfov, args.vfov)?,
            None => Vec::new(),
        };
        let offset = cameras.len();
        for (idx, source) in args.cameras.iter().enumerate() {
            cameras.push(CameraDescriptor {
                name: default_camera_name(offset + idx, source),
                source: source.clone(),
                hfov_deg: args.hfov,
                vfov_deg: args.vfov,
            });
        }
        if cameras.is_empty() {
            cameras.push(CameraDescriptor {
                name: default_camera_name(0, "0"),
                source: "0".to_string(),
                hfov_deg: args.hfov,
                vfov_deg: args.vfov,
            });
        }
        validate_registry(&cameras)?;

        let stream = if args.no_stream {
            None
        } else {
            if args.stream_fps == 0 {
                bail!("--stream-fps must be at least 1");
            }
            Some(StreamOptions {
                bind: args.stream_bind,
                fps: args.stream_fps,
            })
        };

        let snapshots = if args.no_snapshots {
            None
        } else {
            if !args.snapshot_interval.is_finite() || args.snapshot_interval <= 0.0 {
                bail!("--snapshot-interval must be a positive number of seconds");
            }
            if args.snapshot_queue == 0 {
                bail!("--snapshot-queue must be at least 1");
            }
            Some(SnapshotOptions {
                directory: args.snapshot_dir,
                interval: Duration::from_secs_f64(args.snapshot_interval),
                queue_capacity: args.snapshot_queue,
            })
        };

        let link = if args.no_mavlink {
            None
        } else {
            if args.mavlink_host.trim().is_empty() {
                bail!("--mavlink-host must not be empty");
            }
            Some(LinkOptions {
                target: format!("{}:{}", args.mavlink_host.trim(), args.mavlink_port),
                listen_port: (args.mavlink_listen_port != 0).then_some(args.mavlink_listen_port),
                system_id: args.system_id,
                component_id: args.component_id,
            })
        };

        Ok(Self {
            cameras,
            width: args.width,
            height: args.height,
            detector: DetectorOptions {
                model_path: args.model_path,
                use_cpu: args.use_cpu,
                use_nvdec: args.use_nvdec,
                input_width: args.detector_width,
                input_height: args.detector_height,
                iou_threshold: args.iou,
                labels: args
                    .labels
                    .into_iter()
                    .map(|label| label.trim().to_string())
                    .collect(),
            },
            processing: ProcessingOptions {
                confidence_floor: args.confidence,
                tracked_classes: args.tracked_classes,
                wait_timeout: Duration::from_millis(args.wait_timeout_ms),
                jpeg_quality: args.jpeg_quality,
            },
            stream,
            snapshots,
            link,
            display: args.display,
            on_generate: args
                .on_generate
                .map(|command| command.trim().to_string())
                .filter(|command| !command.is_empty()),
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

impl VisionConfig {
    /// Label for `class_id`, falling back to `CLS<id>`.
    pub(crate) fn class_label(&self, class_id: i64) -> String {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.detector.labels.get(idx))
            .filter(|label| !label.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("CLS{class_id}"))
    }
}

fn validate_fov(value: f32, flag: &str) -> Result<()> {
    if !(value > 0.0 && value < 180.0) {
        bail!("{flag} must be between 0 and 180 degrees");
    }
    Ok(())
}

fn validate_registry(cameras: &[CameraDescriptor]) -> Result<()> {
    for (idx, camera) in cameras.iter().enumerate() {
        if camera.source.trim().is_empty() {
            bail!("camera #{idx} has an empty source");
        }
        if camera.name.is_empty()
            || !camera
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "camera name {:?} must be non-empty and use only [A-Za-z0-9_-]",
                camera.name
            );
        }
        validate_fov(camera.hfov_deg, &format!("camera {} hfov", camera.name))?;
        validate_fov(camera.vfov_deg, &format!("camera {} vfov", camera.name))?;
        if cameras[..idx].iter().any(|other| other.name == camera.name) {
            bail!("camera name {:?} is used more than once", camera.name);
        }
    }
    Ok(())
}

/// `cam<N>` for device indices, otherwise `cam<position>`.
fn default_camera_name(position: usize, source: &str) -> String {
    match video_ingest::parse_device_index(source) {
        Some(index) => format!("cam{index}"),
        None => format!("cam{position}"),
    }
}

fn load_camera_file(path: &Path, hfov: f32, vfov: f32) -> Result<Vec<CameraDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read camera registry {}", path.display()))?;
    parse_camera_registry(&raw, hfov, vfov)
        .with_context(|| format!("Invalid camera registry {}", path.display()))
}

fn parse_camera_registry(raw: &str, hfov: f32, vfov: f32) -> Result<Vec<CameraDescriptor>> {
    let file: CameraFile = toml::from_str(raw).map_err(|err| anyhow!("{err}"))?;
    Ok(file
        .cameras
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| CameraDescriptor {
            name: entry
                .name
                .unwrap_or_else(|| default_camera_name(idx, &entry.source)),
            source: entry.source,
            hfov_deg: entry.hfov.unwrap_or(hfov),
            vfov_deg: entry.vfov.unwrap_or(vfov),
        })
        .collect())
}
