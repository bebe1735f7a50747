use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

/// Stand-in used when no model could be loaded. Every call fails with
/// `ModelUnavailable`, which the pipeline degrades to "no detections".
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl DetectorBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn detect(&mut self, _frame: &Frame, _confidence_floor: f32) -> Result<Vec<Detection>, PipelineError> {
        Err(PipelineError::ModelUnavailable(self.reason.clone()))
    }
}
