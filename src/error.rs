//! Error taxonomy for the frame pipeline.
//!
//! Severity is encoded by where each variant is raised, not by the type:
//! - `SourceUnavailable` and `DecodeError` end a pipeline run.
//! - `ModelUnavailable`, `InferenceError` and `EncodeError` are per-frame and
//!   never escape the stage that produced them.
//! - `TelemetryDeliveryError` is swallowed by the publisher after logging.
//! - `InvalidRateConfig` is returned to the control surface; no state changes.
//! - `AlreadyStarted` rejects a second start on the same stream; the running
//!   stream is untouched.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("video source {uri:?} is unavailable: {reason}")]
    SourceUnavailable { uri: String, reason: String },
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("detection model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceError(String),
    #[error("frame encoding failed: {0}")]
    EncodeError(String),
    #[error("telemetry delivery failed: {0}")]
    TelemetryDeliveryError(String),
    #[error("invalid rate configuration: {0}")]
    InvalidRateConfig(String),
    #[error("stream already started (state: {0})")]
    AlreadyStarted(String),
}

impl PipelineError {
    pub(crate) fn source_unavailable(uri: &str, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that terminate a pipeline run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceUnavailable { .. } | PipelineError::DecodeError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_source_level_errors_are_fatal() {
        assert!(PipelineError::source_unavailable("a.mp4", "missing").is_fatal());
        assert!(PipelineError::DecodeError("eof".into()).is_fatal());
        assert!(!PipelineError::ModelUnavailable("none".into()).is_fatal());
        assert!(!PipelineError::InferenceError("boom".into()).is_fatal());
        assert!(!PipelineError::TelemetryDeliveryError("down".into()).is_fatal());
        assert!(!PipelineError::InvalidRateConfig("0".into()).is_fatal());
        assert!(!PipelineError::AlreadyStarted("Running".into()).is_fatal());
    }

    #[test]
    fn source_unavailable_names_the_uri() {
        let err = PipelineError::source_unavailable("clips/road.mp4", "no such file");
        let text = err.to_string();
        assert!(text.contains("clips/road.mp4"));
        assert!(text.contains("no such file"));
    }
}
