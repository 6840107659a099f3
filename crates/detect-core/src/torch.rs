//! TorchScript detector backend.

use std::convert::TryFrom;
use std::path::Path;

use anyhow::{bail, Result};
use tch::{self, Device, Kind, Tensor};

use crate::{Detector, RawDetection};

const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed detector. Frames are resized by the caller to the
/// module's expected input size; outputs come back in frame pixels.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
}

impl TorchDetector {
    /// Load a TorchScript module and prepare it for execution.
    pub fn load<P: AsRef<Path>>(model_path: P, input_size: (i64, i64)) -> Result<Self> {
        let device = Device::cuda_if_available();
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
        })
    }

    /// Converts a BGR8 frame into a normalized RGB CHW tensor.
    fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Result<Tensor> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {expected}",
                bgr.len()
            );
        }
        let (in_w, in_h) = self.input_size;
        if (width as i64, height as i64) != (in_w, in_h) {
            bail!("frame size {width}x{height} does not match detector input {in_w}x{in_h}");
        }

        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .flip([3]) // BGR -> RGB
            .permute([0, 3, 1, 2])
            / 255.0;

        Ok(tensor)
    }
}

impl Detector for TorchDetector {
    fn detect(&mut self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<RawDetection>> {
        let input = self.bgr_to_tensor(bgr, width, height)?;
        let output = self.module.forward_ts(&[input])?;

        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,conf), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < 5 {
                continue;
            }
            let score = row[4];
            // Coarse pre-filter; the invoker applies the configured threshold.
            if score < 0.05 {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
            detections.push(RawDetection {
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                score,
                class_id,
            });
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }

        Ok(detections)
    }
}
