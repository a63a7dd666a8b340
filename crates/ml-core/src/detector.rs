use std::{convert::TryFrom, path::Path, sync::Mutex};

use anyhow::{Result, anyhow, bail};
use tch::{self, Device, Kind, Tensor};

use crate::{Detection, ObjectDetector, non_max_suppression};

/// TorchScript-exported YOLO detector.
///
/// Expects the usual `[1, 4 + classes, predictions]` output layout with boxes
/// as centre/extent in detector-input pixels. The module is behind a mutex so
/// camera threads can share one instance.
pub struct TorchDetector {
    module: Mutex<tch::CModule>,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl TorchDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let module = tch::CModule::load_on_device(model_path, device)?;
        tracing::info!(model = %model_path.display(), ?device, "TorchScript detector loaded");
        Ok(Self {
            module: Mutex::new(module),
            device,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            labels: Vec::new(),
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    /// Override the IoU threshold used by non-maximum suppression.
    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn input_size(&self) -> (i64, i64) {
        self.input_size
    }

    /// Converts a BGR frame into a normalised RGB NCHW tensor at the detector
    /// input resolution.
    fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Result<Tensor> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                bgr.len(),
                expected
            );
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, height as i64, width as i64, 3])
            .permute([0, 3, 1, 2])
            .flip([1])
            / 255.0;

        if (width as i64, height as i64) == (in_w, in_h) {
            Ok(tensor)
        } else {
            Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
        }
    }

    fn decode(&self, output: &Tensor, width: i32, height: i32) -> Result<Vec<Detection>> {
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,score), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = width as f32 / in_w as f32;
        let scale_y = height as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_offset, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            detections.push(Detection {
                bbox_xywh: [
                    row[0] * scale_x,
                    row[1] * scale_y,
                    row[2] * scale_x,
                    row[3] * scale_y,
                ],
                score,
                class_id: class_offset as i64,
            });
        }

        Ok(non_max_suppression(detections, self.iou_threshold))
    }
}

impl ObjectDetector for TorchDetector {
    fn detect(&self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>> {
        let input = self.bgr_to_tensor(bgr, width, height)?;
        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| anyhow!("detector module poisoned"))?;
            tch::no_grad(|| module.forward_ts(&[input]))?
        };
        self.decode(&output, width, height)
    }

    fn class_name(&self, class_id: i64) -> Option<&str> {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.labels.get(idx))
            .map(String::as_str)
    }
}
