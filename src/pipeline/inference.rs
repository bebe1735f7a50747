//! Inference stage: bounded inbound queue of frames, one worker thread,
//! bounded outbound queue of results.
//!
//! - `submit` never blocks. A full inbound queue drops the new frame and
//!   counts it.
//! - The worker keeps FIFO order, resizes to the inference resolution, and
//!   turns detector errors and panics into an empty result for that frame.
//! - `shutdown` drains the inbound queue, sends the stop sentinel and joins
//!   the worker. After it returns no detector call is in flight.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::detect::{Detection, DetectionResult, SharedDetector};
use crate::error::PipelineError;
use crate::frame::Frame;

/// Worker wait on an empty inbound queue before re-checking the stop flag.
const IDLE_POLL: Duration = Duration::from_millis(10);
/// Worker wait on a full outbound queue before re-checking the stop flag.
const DELIVER_POLL: Duration = Duration::from_millis(20);
/// Emit an info summary every this many drops.
const DROP_SUMMARY_EVERY: u64 = 100;

/// Inference counters. A stage may report into a parent so the service can
/// serve totals across every stream.
#[derive(Debug, Default)]
pub struct InferenceStats {
    submitted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failures: AtomicU64,
    parent: Option<Arc<InferenceStats>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InferenceSnapshot {
    /// Frames offered to the stage, accepted or not.
    pub submitted: u64,
    /// Frames rejected because the inbound queue was full.
    pub dropped: u64,
    /// Results delivered with detector output.
    pub processed: u64,
    /// Results delivered empty because the detector failed.
    pub failures: u64,
}

impl InferenceSnapshot {
    /// Accepted frames that have not produced a result yet.
    pub fn pending(&self) -> u64 {
        self.submitted
            .saturating_sub(self.dropped)
            .saturating_sub(self.processed)
            .saturating_sub(self.failures)
    }
}

impl InferenceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_of(parent: Arc<InferenceStats>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> InferenceSnapshot {
        InferenceSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    fn bump(&self, counter: fn(&InferenceStats) -> &AtomicU64) -> u64 {
        if let Some(parent) = &self.parent {
            parent.bump(counter);
        }
        counter(self).fetch_add(1, Ordering::SeqCst) + 1
    }
}

enum Inbound {
    Frame(Frame),
    Stop,
}

/// Outcome of offering a frame to the stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Dropped,
}

pub struct InferenceStage {
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    outbound_rx: Receiver<DetectionResult>,
    stop: Arc<AtomicBool>,
    stats: Arc<InferenceStats>,
    worker: Option<JoinHandle<()>>,
}

struct WorkerContext {
    detector: SharedDetector,
    inbound: Receiver<Inbound>,
    outbound: Sender<DetectionResult>,
    stop: Arc<AtomicBool>,
    stats: Arc<InferenceStats>,
    width: u32,
    height: u32,
    confidence_floor: f32,
}

impl InferenceStage {
    pub fn spawn(
        detector: SharedDetector,
        config: &PipelineConfig,
        stats: Arc<InferenceStats>,
    ) -> Result<Self, PipelineError> {
        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(config.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) =
            crossbeam_channel::bounded(config.outbound_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let ctx = WorkerContext {
            detector,
            inbound: inbound_rx.clone(),
            outbound: outbound_tx,
            stop: stop.clone(),
            stats: stats.clone(),
            width: config.input_width,
            height: config.input_height,
            confidence_floor: config.confidence_floor,
        };
        let worker = std::thread::Builder::new()
            .name("inference-worker".into())
            .spawn(move || run_worker(ctx))
            .map_err(|e| PipelineError::InferenceError(format!("spawn inference worker: {}", e)))?;

        Ok(Self {
            inbound_tx,
            inbound_rx,
            outbound_rx,
            stop,
            stats,
            worker: Some(worker),
        })
    }

    /// Offer a sampled frame. Never blocks.
    pub fn submit(&self, frame: Frame) -> Submission {
        self.stats.bump(|s| &s.submitted);
        let index = frame.index;
        match self.inbound_tx.try_send(Inbound::Frame(frame)) {
            Ok(()) => Submission::Accepted,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let dropped = self.stats.bump(|s| &s.dropped);
                log::debug!("inference queue full; dropped frame {}", index);
                if dropped % DROP_SUMMARY_EVERY == 0 {
                    log::info!("inference backlog: {} frames dropped so far", dropped);
                }
                Submission::Dropped
            }
        }
    }

    /// Next finished result, if one is ready.
    pub fn try_result(&self) -> Option<DetectionResult> {
        match self.outbound_rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next result.
    pub fn result_timeout(&self, timeout: Duration) -> Option<DetectionResult> {
        self.outbound_rx.recv_timeout(timeout).ok()
    }

    /// True when every accepted frame has produced a result and all results
    /// have been taken.
    pub fn is_idle(&self) -> bool {
        self.stats.snapshot().pending() == 0 && self.outbound_rx.is_empty()
    }

    pub fn stats(&self) -> InferenceSnapshot {
        self.stats.snapshot()
    }

    /// Stop the worker and wait for it to exit. Queued frames and unread
    /// results are discarded.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        let discarded = self.inbound_rx.try_iter().count();
        if self.inbound_tx.try_send(Inbound::Stop).is_err() {
            log::debug!("inference stop sentinel not queued; worker exits on stop flag");
        }
        if worker.join().is_err() {
            log::error!("inference worker panicked outside the detector guard");
        }
        let unread = self.outbound_rx.try_iter().count();
        log::debug!(
            "inference stage stopped ({} queued frames discarded, {} results unread)",
            discarded,
            unread
        );
    }
}

impl Drop for InferenceStage {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn run_worker(ctx: WorkerContext) {
    log::debug!("inference worker started");
    while !ctx.stop.load(Ordering::SeqCst) {
        let frame = match ctx.inbound.recv_timeout(IDLE_POLL) {
            Ok(Inbound::Frame(frame)) => frame,
            Ok(Inbound::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        };

        let frame = frame.resized(ctx.width, ctx.height);
        let (result, failed) = match run_detector(&ctx.detector, &frame, ctx.confidence_floor) {
            Ok(detections) => (DetectionResult::new(frame, detections), false),
            Err(err) => {
                log::warn!("detector failed on frame {}: {}", frame.index, err);
                (DetectionResult::failed(frame), true)
            }
        };

        if !deliver(&ctx.outbound, result, &ctx.stop) {
            break;
        }
        if failed {
            ctx.stats.bump(|s| &s.failures);
        } else {
            ctx.stats.bump(|s| &s.processed);
        }
    }
    log::debug!("inference worker exiting");
}

fn run_detector(
    detector: &SharedDetector,
    frame: &Frame,
    confidence_floor: f32,
) -> Result<Vec<Detection>, PipelineError> {
    let mut guard = match detector.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match panic::catch_unwind(AssertUnwindSafe(|| guard.detect(frame, confidence_floor))) {
        Ok(result) => result,
        Err(payload) => Err(PipelineError::InferenceError(format!(
            "detector panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Push a result, waiting while the outbound queue is full. Returns false
/// when the stage is stopping and the result was discarded.
fn deliver(
    outbound: &Sender<DetectionResult>,
    mut result: DetectionResult,
    stop: &AtomicBool,
) -> bool {
    loop {
        match outbound.send_timeout(result, DELIVER_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if stop.load(Ordering::SeqCst) {
                    return false;
                }
                result = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{share_detector, BoundingBox, ScriptedBackend};
    use std::time::Instant;

    fn config(capacity: usize) -> PipelineConfig {
        PipelineConfig {
            inbound_capacity: capacity,
            outbound_capacity: capacity,
            input_width: 8,
            input_height: 8,
            ..PipelineConfig::default()
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::from_rgb(vec![index as u8; 16 * 12 * 3], 16, 12, index).expect("frame")
    }

    fn collect(stage: &InferenceStage, count: usize) -> Vec<DetectionResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < count && Instant::now() < deadline {
            if let Some(result) = stage.result_timeout(Duration::from_millis(50)) {
                results.push(result);
            }
        }
        results
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn results_keep_fifo_order_and_inference_size() {
        let det = Detection::new(BoundingBox::new(1.0, 1.0, 4.0, 4.0), 0, 0.9);
        let backend = ScriptedBackend::new(vec![det]);
        let stage = InferenceStage::spawn(
            share_detector(Box::new(backend)),
            &config(30),
            Arc::new(InferenceStats::new()),
        )
        .expect("spawn");
        for i in 0..10 {
            assert_eq!(stage.submit(frame(i)), Submission::Accepted);
        }
        let results = collect(&stage, 10);
        let indices: Vec<u64> = results.iter().map(|r| r.frame_index()).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert!(results
            .iter()
            .all(|r| r.frame.width == 8 && r.frame.height == 8 && r.detections.len() == 1));
        wait_for(|| stage.is_idle());
        assert_eq!(stage.stats().processed, 10);
        stage.shutdown();
    }

    #[test]
    fn full_queue_drops_exactly_the_overflow() {
        let (backend, gate) = ScriptedBackend::new(Vec::new()).gated();
        let recorder = backend.recorder();
        let stage = InferenceStage::spawn(
            share_detector(Box::new(backend)),
            &config(4),
            Arc::new(InferenceStats::new()),
        )
        .expect("spawn");

        // Frame 0 is taken by the worker and held at the gate.
        stage.submit(frame(0));
        wait_for(|| recorder.calls() == 1);

        let started = Instant::now();
        let outcomes: Vec<Submission> = (1..=10).map(|i| stage.submit(frame(i))).collect();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            outcomes.iter().filter(|o| **o == Submission::Dropped).count(),
            6
        );
        let stats = stage.stats();
        assert_eq!(stats.submitted, 11);
        assert_eq!(stats.dropped, 6);

        drop(gate);
        let results = collect(&stage, 5);
        let indices: Vec<u64> = results.iter().map(|r| r.frame_index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        stage.shutdown();
    }

    #[test]
    fn detector_error_and_panic_yield_empty_results() {
        let det = Detection::new(BoundingBox::new(0.0, 0.0, 2.0, 2.0), 1, 0.8);
        let backend = ScriptedBackend::new(vec![det])
            .fail_on(1, "tensor shape mismatch")
            .panic_on(2, "model exploded");
        let stage = InferenceStage::spawn(
            share_detector(Box::new(backend)),
            &config(8),
            Arc::new(InferenceStats::new()),
        )
        .expect("spawn");
        for i in 0..4 {
            stage.submit(frame(i));
        }
        let results = collect(&stage, 4);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].detections.len(), 1);
        assert!(results[1].failed && results[1].detections.is_empty());
        assert!(results[2].failed && results[2].detections.is_empty());
        assert_eq!(results[3].detections.len(), 1);
        wait_for(|| stage.is_idle());
        let stats = stage.stats();
        assert_eq!((stats.processed, stats.failures), (2, 2));
        stage.shutdown();
    }

    #[test]
    fn shutdown_waits_for_in_flight_detection() {
        let backend = ScriptedBackend::new(Vec::new()).with_delay(Duration::from_millis(100));
        let recorder = backend.recorder();
        let stage = InferenceStage::spawn(
            share_detector(Box::new(backend)),
            &config(8),
            Arc::new(InferenceStats::new()),
        )
        .expect("spawn");
        for i in 0..5 {
            stage.submit(frame(i));
        }
        wait_for(|| recorder.calls() >= 1);
        stage.shutdown();
        let calls = recorder.calls();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(recorder.calls(), calls);
        assert!(calls < 5);
    }

    #[test]
    fn child_stats_roll_up_into_parent() {
        let parent = Arc::new(InferenceStats::new());
        let child = InferenceStats::child_of(parent.clone());
        child.bump(|s| &s.submitted);
        child.bump(|s| &s.dropped);
        assert_eq!(parent.snapshot().submitted, 1);
        assert_eq!(parent.snapshot().dropped, 1);
        assert_eq!(child.snapshot().pending(), 0);
    }
}
