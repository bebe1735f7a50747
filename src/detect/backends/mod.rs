pub mod scripted;
pub mod stub;
pub mod unavailable;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::{CallRecorder, ScriptedBackend, ScriptedGate, ScriptedOutcome};
pub use stub::StubBackend;
pub use unavailable::UnavailableBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

use crate::config::DetectorSettings;
use crate::detect::backend::DetectorBackend;

/// Build the configured backend. A model that cannot be loaded yields an
/// `UnavailableBackend` so the service keeps streaming without detections.
pub fn build_backend(settings: &DetectorSettings) -> Box<dyn DetectorBackend> {
    let mut backend: Box<dyn DetectorBackend> = match settings.backend.as_str() {
        "stub" => Box::new(StubBackend::new(settings.classes.len())),
        "tract" => load_tract(settings),
        other => {
            log::error!("unknown detector backend {:?}; detections disabled", other);
            Box::new(UnavailableBackend::new(format!("unknown backend {:?}", other)))
        }
    };
    if let Err(err) = backend.warm_up() {
        log::warn!("detector {} warm-up failed: {}", backend.name(), err);
    }
    log::info!("detector backend: {}", backend.name());
    backend
}

#[cfg(feature = "backend-tract")]
fn load_tract(settings: &DetectorSettings) -> Box<dyn DetectorBackend> {
    let Some(path) = settings.model_path.as_ref() else {
        log::error!("tract backend selected without model_path; detections disabled");
        return Box::new(UnavailableBackend::new("no model_path configured"));
    };
    match TractBackend::new(path, settings.input_width, settings.input_height) {
        Ok(backend) => Box::new(backend.with_iou_threshold(settings.iou_threshold)),
        Err(err) => {
            log::error!("failed to load model {}: {:#}", path.display(), err);
            Box::new(UnavailableBackend::new(format!("{:#}", err)))
        }
    }
}

#[cfg(not(feature = "backend-tract"))]
fn load_tract(_settings: &DetectorSettings) -> Box<dyn DetectorBackend> {
    log::error!("tract backend requested but built without the backend-tract feature");
    Box::new(UnavailableBackend::new("built without backend-tract"))
}
