#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::error::PipelineError;
use crate::frame::Frame;

/// Tract-based backend for YOLOv8 ONNX exports.
///
/// Input is `1x3xHxW` RGB scaled to `[0, 1]`. Output is `[1, 4 + nc, N]`:
/// centre-xywh in input pixels followed by one score per class.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            iou_threshold: crate::config::DEFAULT_IOU_THRESHOLD,
        })
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        let pixels = frame.pixels();
        let width = frame.width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, frame.height as usize, width),
            |(_, channel, y, x)| pixels[(y * width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, confidence_floor: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a [1, 4 + classes, anchors] output")?;
        let (_, attributes, anchors) = view.dim();
        if attributes < 5 {
            return Err(anyhow!("output has {} attributes, need at least 5", attributes));
        }

        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..attributes)
                .map(|attr| (attr - 4, view[[0, attr, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if !score.is_finite() || score < confidence_floor {
                continue;
            }
            let bbox = BoundingBox::from_center(
                view[[0, 0, anchor]],
                view[[0, 1, anchor]],
                view[[0, 2, anchor]],
                view[[0, 3, anchor]],
            )
            .clamped(self.width, self.height);
            detections.push(Detection::new(bbox, class_id, score));
        }
        non_max_suppression(&mut detections, self.iou_threshold);
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        confidence_floor: f32,
    ) -> Result<Vec<Detection>, PipelineError> {
        let input = self
            .build_input(frame)
            .map_err(|e| PipelineError::InferenceError(format!("{:#}", e)))?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| PipelineError::InferenceError(format!("ONNX inference failed: {:#}", e)))?;
        self.decode(outputs, confidence_floor)
            .map_err(|e| PipelineError::InferenceError(format!("{:#}", e)))
    }

    fn warm_up(&mut self) -> Result<(), PipelineError> {
        let blank = Frame::from_rgb(
            vec![0u8; self.width as usize * self.height as usize * 3],
            self.width,
            self.height,
            0,
        )?;
        self.detect(&blank, 1.0).map(|_| ())
    }
}
