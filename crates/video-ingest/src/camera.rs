//! OpenCV-backed capture.

use std::time::Instant;

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    CaptureDevice, DeviceOpener, parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

/// Opens V4L devices or files through `cv::VideoCapture`.
#[derive(Clone, Debug)]
pub struct OpenCvOpener {
    target_size: (i32, i32),
    fps: f64,
}

impl OpenCvOpener {
    pub fn new(target_size: (i32, i32)) -> Self {
        Self {
            target_size,
            fps: 30.0,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }
}

impl DeviceOpener for OpenCvOpener {
    fn open(&self, source: &str) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let mut cap = open_video_capture(source)?;
        configure_camera(&mut cap, self.target_size, self.fps);
        Ok(Box::new(OpenCvDevice {
            cap: Some(cap),
            uri: source.to_string(),
            target_size: self.target_size,
            frame: Mat::default(),
            scratch: Mat::default(),
        }))
    }
}

struct OpenCvDevice {
    cap: Option<VideoCapture>,
    uri: String,
    target_size: (i32, i32),
    frame: Mat,
    scratch: Mat,
}

impl CaptureDevice for OpenCvDevice {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(cap) = self.cap.as_mut() else {
            return Ok(None);
        };
        let grabbed = cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Ok(None);
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            return Ok(None);
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();
        let expected = (target_w as usize) * (target_h as usize) * 3;
        if data.len() != expected {
            return Err(CaptureError::ShortFrame {
                uri: self.uri.clone(),
                got: data.len(),
                expected,
            });
        }

        Ok(Some(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            captured_at: Instant::now(),
            format: FrameFormat::Bgr8,
        }))
    }

    fn release(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            if let Err(err) = cap.release() {
                warn!("failed to release {}: {err}", self.uri);
            }
        }
    }
}

impl Drop for OpenCvDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
