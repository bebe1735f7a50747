use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::error::PipelineError;
use crate::frame::Frame;

/// Maximum detections the stub derives from one digest.
const MAX_DETECTIONS: usize = 3;

/// Stub backend for demos and tests. Hashes the pixels and derives up to
/// three boxes from the digest, so identical frames always yield identical
/// detections.
pub struct StubBackend {
    class_count: usize,
}

impl StubBackend {
    pub fn new(class_count: usize) -> Self {
        Self {
            class_count: class_count.max(1),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(3)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        confidence_floor: f32,
    ) -> Result<Vec<Detection>, PipelineError> {
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let count = digest[0] as usize % (MAX_DETECTIONS + 1);
        let (width, height) = (frame.width as f32, frame.height as f32);

        let mut detections = Vec::with_capacity(count);
        for i in 0..count {
            let chunk = &digest[1 + i * 6..7 + i * 6];
            let x1 = chunk[0] as f32 / 255.0 * width * 0.7;
            let y1 = chunk[1] as f32 / 255.0 * height * 0.7;
            let w = (0.1 + chunk[2] as f32 / 255.0 * 0.2) * width;
            let h = (0.1 + chunk[3] as f32 / 255.0 * 0.2) * height;
            let confidence = 0.2 + chunk[4] as f32 / 255.0 * 0.79;
            if confidence < confidence_floor {
                continue;
            }
            let bbox = BoundingBox::new(x1, y1, x1 + w, y1 + h).clamped(frame.width, frame.height);
            detections.push(Detection::new(
                bbox,
                chunk[5] as usize % self.class_count,
                confidence,
            ));
        }
        Ok(detections)
    }
}
