use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

/// Detector adapter.
///
/// Receives frames already resized to the inference resolution. Returned
/// boxes are in that frame's pixel coordinates and every detection must meet
/// `confidence_floor`. A backend that has no model fails with
/// `ModelUnavailable`; the pipeline treats any error as "no detections" for
/// the frame.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame, confidence_floor: f32)
        -> Result<Vec<Detection>, PipelineError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(
        &mut self,
        frame: &Frame,
        confidence_floor: f32,
    ) -> Result<Vec<Detection>, PipelineError> {
        (**self).detect(frame, confidence_floor)
    }

    fn warm_up(&mut self) -> Result<(), PipelineError> {
        (**self).warm_up()
    }
}

/// Detector shared by every pipeline in the process. Calls are serialised by
/// the mutex; each pipeline's worker holds the lock only for one frame.
pub type SharedDetector = std::sync::Arc<std::sync::Mutex<Box<dyn DetectorBackend>>>;

pub fn share_detector(backend: Box<dyn DetectorBackend>) -> SharedDetector {
    std::sync::Arc::new(std::sync::Mutex::new(backend))
}
