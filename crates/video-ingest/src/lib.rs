//! Capture backends that turn cameras, files and network feeds into owned
//! [`Frame`]s.
//!
//! A backend is split in two: a [`DeviceOpener`] that knows how to reach a
//! source, and the [`CaptureDevice`] handle it returns. The handle is read on
//! the caller's thread; nothing here spawns threads or buffers frames, so the
//! caller decides how to hand frames downstream.

mod ffmpeg;
#[cfg(feature = "opencv")]
mod camera;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvOpener;
pub use ffmpeg::{FfmpegDevice, FfmpegOpener};
pub use types::{CaptureError, Frame, FrameFormat, SourceKind};

/// An open video source.
pub trait CaptureDevice: Send {
    /// Block until the next frame is available.
    ///
    /// Returns `Ok(None)` once the source has no more frames (end of file,
    /// device unplugged cleanly, process exited).
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Release the underlying handle. Calling this more than once is a no-op.
    fn release(&mut self);
}

/// Factory for [`CaptureDevice`]s.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// Parse a `/dev/videoX` style URI or bare index and return the index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_index_accepts_bare_numbers_and_dev_paths() {
        assert_eq!(parse_device_index("2"), Some(2));
        assert_eq!(parse_device_index("/dev/video4"), Some(4));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("/dev/videoX"), None);
        assert_eq!(parse_device_index("clip.mp4"), None);
    }

    #[test]
    fn source_kind_follows_scheme() {
        assert_eq!(SourceKind::from_uri("rtsp://cam/1"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("rtsps://cam/1"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("udp://0.0.0.0:5000"), SourceKind::Udp);
        assert_eq!(SourceKind::from_uri("0"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("runs/flight.mp4"), SourceKind::Device);
    }
}
