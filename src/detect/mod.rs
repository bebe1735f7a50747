mod backend;
pub mod backends;
mod labels;
mod result;

pub use backend::{share_detector, DetectorBackend, SharedDetector};
pub use backends::{
    build_backend, CallRecorder, ScriptedBackend, ScriptedGate, ScriptedOutcome, StubBackend,
    UnavailableBackend,
};
pub use labels::{ClassLabels, UNKNOWN_LABEL};
pub use result::{non_max_suppression, BoundingBox, Detection, DetectionResult};
