use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

/// What a scripted backend does for one frame.
#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    Detections(Vec<Detection>),
    Fail(String),
    Panic(String),
}

/// Detector double with per-frame programmed outcomes.
///
/// Outcomes are keyed by `Frame::index`; frames without an entry get the
/// default detections. The detector honours the confidence floor like a real
/// model would, unless `ignore_floor` is set to exercise the annotator's own
/// filtering.
pub struct ScriptedBackend {
    default: Vec<Detection>,
    per_frame: HashMap<u64, ScriptedOutcome>,
    ignore_floor: bool,
    delay: Option<Duration>,
    gate: Option<Receiver<()>>,
    recorder: CallRecorder,
}

/// Shared view of the frames a scripted backend has been called with.
#[derive(Clone, Debug, Default)]
pub struct CallRecorder {
    seen: Arc<Mutex<Vec<u64>>>,
}

impl CallRecorder {
    /// Frame indices in call order.
    pub fn seen(&self) -> Vec<u64> {
        match self.seen.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen().len()
    }

    fn record(&self, index: u64) {
        match self.seen.lock() {
            Ok(mut guard) => guard.push(index),
            Err(poisoned) => poisoned.into_inner().push(index),
        }
    }
}

/// Releases a gated backend one call at a time. Dropping the handle releases
/// every pending and future call.
pub struct ScriptedGate {
    tx: Sender<()>,
}

impl ScriptedGate {
    pub fn release(&self, calls: usize) {
        for _ in 0..calls {
            if self.tx.send(()).is_err() {
                break;
            }
        }
    }
}

impl ScriptedBackend {
    pub fn new(default: Vec<Detection>) -> Self {
        Self {
            default,
            per_frame: HashMap::new(),
            ignore_floor: false,
            delay: None,
            gate: None,
            recorder: CallRecorder::default(),
        }
    }

    pub fn on_frame(mut self, index: u64, outcome: ScriptedOutcome) -> Self {
        self.per_frame.insert(index, outcome);
        self
    }

    pub fn fail_on(self, index: u64, message: impl Into<String>) -> Self {
        self.on_frame(index, ScriptedOutcome::Fail(message.into()))
    }

    pub fn panic_on(self, index: u64, message: impl Into<String>) -> Self {
        self.on_frame(index, ScriptedOutcome::Panic(message.into()))
    }

    /// Return detections below the floor too.
    pub fn ignore_floor(mut self) -> Self {
        self.ignore_floor = true;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block every call until the returned gate releases it.
    pub fn gated(mut self) -> (Self, ScriptedGate) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.gate = Some(rx);
        (self, ScriptedGate { tx })
    }

    pub fn recorder(&self) -> CallRecorder {
        self.recorder.clone()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        confidence_floor: f32,
    ) -> Result<Vec<Detection>, PipelineError> {
        self.recorder.record(frame.index);
        if let Some(gate) = &self.gate {
            // Err means the gate handle is gone: run freely.
            let _ = gate.recv();
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let detections = match self.per_frame.get(&frame.index) {
            Some(ScriptedOutcome::Fail(message)) => {
                return Err(PipelineError::InferenceError(message.clone()))
            }
            Some(ScriptedOutcome::Panic(message)) => panic!("{}", message),
            Some(ScriptedOutcome::Detections(detections)) => detections.clone(),
            None => self.default.clone(),
        };
        if self.ignore_floor {
            return Ok(detections);
        }
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= confidence_floor)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn frame(index: u64) -> Frame {
        Frame::from_rgb(vec![0u8; 4 * 4 * 3], 4, 4, index).expect("frame")
    }

    fn det(confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(0.0, 0.0, 2.0, 2.0), 0, confidence)
    }

    #[test]
    fn per_frame_outcomes_override_default() {
        let mut backend = ScriptedBackend::new(vec![det(0.9)]).fail_on(2, "bad frame");
        assert_eq!(backend.detect(&frame(1), 0.3).expect("ok").len(), 1);
        assert!(matches!(
            backend.detect(&frame(2), 0.3),
            Err(PipelineError::InferenceError(_))
        ));
        assert_eq!(backend.recorder().seen(), vec![1, 2]);
    }

    #[test]
    fn floor_is_applied_unless_ignored() {
        let mut strict = ScriptedBackend::new(vec![det(0.25), det(0.8)]);
        assert_eq!(strict.detect(&frame(0), 0.3).expect("ok").len(), 1);
        let mut loose = ScriptedBackend::new(vec![det(0.25), det(0.8)]).ignore_floor();
        assert_eq!(loose.detect(&frame(0), 0.3).expect("ok").len(), 2);
    }

    #[test]
    fn dropped_gate_releases_calls() {
        let (mut backend, gate) = ScriptedBackend::new(Vec::new()).gated();
        drop(gate);
        assert!(backend.detect(&frame(0), 0.3).expect("ok").is_empty());
    }

    #[test]
    fn gate_releases_one_call_per_permit() {
        let (mut backend, gate) = ScriptedBackend::new(vec![det(0.9)]).gated();
        let recorder = backend.recorder();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let worker = std::thread::spawn(move || {
            for index in 0..3 {
                let found = backend.detect(&frame(index), 0.3).expect("ok").len();
                let _ = done_tx.send((index, found));
            }
        });

        gate.release(2);
        let wait = Duration::from_secs(2);
        assert_eq!(done_rx.recv_timeout(wait).expect("first"), (0, 1));
        assert_eq!(done_rx.recv_timeout(wait).expect("second"), (1, 1));
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(recorder.seen(), vec![0, 1, 2]);

        gate.release(1);
        assert_eq!(done_rx.recv_timeout(wait).expect("third"), (2, 1));
        worker.join().expect("worker");
    }
}
