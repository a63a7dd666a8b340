use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use actix_web::web::Bytes;
use image::RgbImage;
use ml_core::Detection;
use serde::Serialize;

/// Detector output for one frame together with its timing.
#[derive(Clone, Debug)]
pub(crate) struct DetectionSet {
    pub(crate) detections: Vec<Detection>,
    /// Wall-clock capture time in epoch milliseconds.
    pub(crate) timestamp_ms: i64,
    pub(crate) captured_at: Instant,
    pub(crate) processed_at: Instant,
}

/// Frame with the overlay burned in, ready for display or encoding.
#[derive(Clone)]
pub(crate) struct AnnotatedFrame {
    pub(crate) stream: Arc<str>,
    pub(crate) image: RgbImage,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
}

/// Encoded frame kept per stream for HTTP clients.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Bytes,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class: String,
    pub(crate) class_id: i64,
    pub(crate) score: f32,
    /// `[left, top, right, bottom]` in frame pixels.
    pub(crate) bbox: [f32; 4],
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) stream: &'a str,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
    pub(crate) detections: &'a [DetectionSummary],
}

pub(crate) type SharedFrame = Arc<Mutex<Option<FramePacket>>>;
