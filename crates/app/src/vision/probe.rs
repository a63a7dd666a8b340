//! `probe` subcommand: find which capture sources actually deliver frames.

use std::{sync::Arc, time::Instant};

use anyhow::{Result, bail};
use clap::Args;
use tracing::{info, warn};
use video_ingest::{DeviceOpener, SourceKind};

use crate::vision::pipeline::capture_opener;

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Source to try (device index, file, or URL). Repeatable. When absent,
    /// device indices `0..max-index` are tried instead.
    #[arg(long = "source", value_name = "URI")]
    pub sources: Vec<String>,
    /// Highest device index tried when no --source is given (exclusive).
    #[arg(long, default_value_t = 10)]
    pub max_index: u32,
    #[arg(long, default_value_t = 640)]
    pub width: i32,
    #[arg(long, default_value_t = 480)]
    pub height: i32,
    /// Decode through ffmpeg with NVDEC.
    #[arg(long = "nvdec")]
    pub use_nvdec: bool,
}

/// Result of probing one source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProbeOutcome {
    pub(crate) source: String,
    pub(crate) kind: SourceKind,
    pub(crate) status: ProbeStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProbeStatus {
    /// A frame of the given size arrived after `first_frame_ms`.
    Ok {
        width: i32,
        height: i32,
        first_frame_ms: u64,
    },
    OpenFailed(String),
    NoFrame,
    ReadFailed(String),
}

impl ProbeStatus {
    fn is_ok(&self) -> bool {
        matches!(self, ProbeStatus::Ok { .. })
    }
}

pub fn run(args: ProbeArgs) -> Result<()> {
    if args.width <= 0 || args.height <= 0 {
        bail!("Probe width and height must be positive integers");
    }
    let opener = capture_opener(args.width, args.height, args.use_nvdec);
    let sources = if args.sources.is_empty() {
        (0..args.max_index).map(|idx| idx.to_string()).collect()
    } else {
        args.sources
    };

    let outcomes = probe_sources(opener, &sources);
    for outcome in &outcomes {
        match &outcome.status {
            ProbeStatus::Ok {
                width,
                height,
                first_frame_ms,
            } => println!(
                "{:<24} {:?}  ok  {width}x{height}  first frame after {first_frame_ms} ms",
                outcome.source, outcome.kind
            ),
            ProbeStatus::OpenFailed(err) => {
                println!("{:<24} {:?}  unavailable  {err}", outcome.source, outcome.kind)
            }
            ProbeStatus::NoFrame => {
                println!("{:<24} {:?}  opened but no frame", outcome.source, outcome.kind)
            }
            ProbeStatus::ReadFailed(err) => {
                println!("{:<24} {:?}  read failed  {err}", outcome.source, outcome.kind)
            }
        }
    }

    let working = outcomes.iter().filter(|o| o.status.is_ok()).count();
    info!(probed = outcomes.len(), working, "Probe finished");
    if working == 0 {
        bail!("No working capture source found");
    }
    Ok(())
}

/// Open each source, read one frame and release it again.
pub(crate) fn probe_sources(opener: Arc<dyn DeviceOpener>, sources: &[String]) -> Vec<ProbeOutcome> {
    sources
        .iter()
        .map(|source| {
            let kind = SourceKind::from_uri(source);
            let status = probe_one(opener.as_ref(), source);
            if !status.is_ok() {
                warn!(source = %source, ?status, "Probe failed");
            }
            ProbeOutcome {
                source: source.clone(),
                kind,
                status,
            }
        })
        .collect()
}

fn probe_one(opener: &dyn DeviceOpener, source: &str) -> ProbeStatus {
    let started = Instant::now();
    let mut device = match opener.open(source) {
        Ok(device) => device,
        Err(err) => return ProbeStatus::OpenFailed(err.to_string()),
    };
    let status = match device.read_frame() {
        Ok(Some(frame)) => ProbeStatus::Ok {
            width: frame.width,
            height: frame.height,
            first_frame_ms: started.elapsed().as_millis() as u64,
        },
        Ok(None) => ProbeStatus::NoFrame,
        Err(err) => ProbeStatus::ReadFailed(err.to_string()),
    };
    device.release();
    status
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use video_ingest::{CaptureDevice, CaptureError, Frame, FrameFormat};

    use super::*;

    struct ScriptedOpener {
        released: Arc<AtomicUsize>,
    }

    struct ScriptedDevice {
        source: String,
        released: Arc<AtomicUsize>,
    }

    impl DeviceOpener for ScriptedOpener {
        fn open(&self, source: &str) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            if source == "1" {
                return Err(CaptureError::Open {
                    uri: source.to_string(),
                });
            }
            Ok(Box::new(ScriptedDevice {
                source: source.to_string(),
                released: self.released.clone(),
            }))
        }
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            match self.source.as_str() {
                "empty.mp4" => Ok(None),
                "broken.mp4" => Err(CaptureError::ShortFrame {
                    uri: self.source.clone(),
                    got: 3,
                    expected: 12,
                }),
                _ => Ok(Some(Frame {
                    data: vec![0; 2 * 2 * 3],
                    width: 2,
                    height: 2,
                    timestamp_ms: 0,
                    captured_at: Instant::now(),
                    format: FrameFormat::Bgr8,
                })),
            }
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reports_each_source_and_releases_what_it_opened() {
        let released = Arc::new(AtomicUsize::new(0));
        let opener = Arc::new(ScriptedOpener {
            released: released.clone(),
        });
        let sources: Vec<String> = ["0", "1", "empty.mp4", "broken.mp4"]
            .into_iter()
            .map(String::from)
            .collect();

        let outcomes = probe_sources(opener, &sources);
        assert_eq!(outcomes.len(), 4);
        assert!(matches!(
            outcomes[0].status,
            ProbeStatus::Ok {
                width: 2,
                height: 2,
                ..
            }
        ));
        assert_eq!(outcomes[0].kind, SourceKind::from_uri("0"));
        assert!(matches!(outcomes[1].status, ProbeStatus::OpenFailed(_)));
        assert_eq!(outcomes[2].status, ProbeStatus::NoFrame);
        assert!(matches!(outcomes[3].status, ProbeStatus::ReadFailed(_)));
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }
}
