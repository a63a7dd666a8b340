use std::time::Instant;

use anyhow::Error;
use thiserror::Error;

/// Owned BGR frame captured from a video source.
///
/// Frames are moved between pipeline stages, never shared, so a consumer can
/// never observe a buffer the capture side is still writing.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Monotonic capture instant used for latency and rate calculations.
    pub captured_at: Instant,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a tightly packed frame of this geometry should hold.
    pub fn expected_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * self.format.channels()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Transport used to reach a video source, inferred from its identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local V4L devices (by index or `/dev/videoN`) or pre-recorded files.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// UDP socket carrying H.264 via RTP.
    Udp,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("udp://") {
            SourceKind::Udp
        } else {
            SourceKind::Device
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} produced a {got} byte frame, expected {expected}")]
    ShortFrame {
        uri: String,
        got: usize,
        expected: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}
