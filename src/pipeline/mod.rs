//! The real-time frame pipeline.
//!
//! `FrameStream` drives one run: read a frame, sample it, submit it to the
//! inference stage, take at most one finished result, annotate it, pace, and
//! yield the multipart chunk. The driving cycle never waits on inference;
//! when no result is ready that cycle yields nothing.
//!
//! Lifecycle: `Idle -> Opening -> Running -> Draining -> Closed`, or
//! `Failed` from `Opening` (source unavailable) and `Running` (decode error).
//! Every exit path joins the inference worker before the source is dropped.

pub mod annotate;
pub mod governor;
pub mod inference;
pub mod multiplex;
pub mod sampler;

pub use annotate::{AnnotatedFrame, Annotator};
pub use governor::{pacing_delay, RateGovernor};
pub use inference::{InferenceSnapshot, InferenceStage, InferenceStats, Submission};
pub use multiplex::{frame_chunk, BOUNDARY, MULTIPART_CONTENT_TYPE};
pub use sampler::{sampling_interval, Sampler};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::detect::{DetectionResult, SharedDetector};
use crate::error::PipelineError;
use crate::ingest::{open_source, FrameSource};
use crate::telemetry::TelemetryEmitter;

/// Wait for outstanding results while draining.
const DRAIN_POLL: Duration = Duration::from_millis(20);
/// Longest uninterrupted slice of the pacing sleep.
const PACE_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Opening,
    Running,
    Draining,
    Closed,
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Closed | PipelineState::Failed(_))
    }
}

/// Cooperative cancellation shared between a stream and its owner.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read-only view of a stream's lifecycle state.
#[derive(Clone, Debug)]
pub struct StateHandle(Arc<Mutex<PipelineState>>);

impl StateHandle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(PipelineState::Idle)))
    }

    pub fn get(&self) -> PipelineState {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set(&self, state: PipelineState) {
        match self.0.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

/// One frame as yielded to the transport.
#[derive(Debug)]
pub struct EmittedFrame {
    /// Position of the annotated frame in the source stream.
    pub index: u64,
    /// Count of frames emitted before this one.
    pub ordinal: u64,
    /// Label texts drawn on the annotated half.
    pub overlays: Vec<String>,
    /// The detector failed on this frame; it carries no detections.
    pub detection_failed: bool,
    /// Multipart chunk (`--frame` header, JPEG, trailing CRLF).
    pub chunk: Vec<u8>,
}

/// Lazy sequence of multipart chunks for one source.
pub struct FrameStream {
    config: PipelineConfig,
    detector: SharedDetector,
    telemetry: TelemetryEmitter,
    cancel: CancelToken,
    state: StateHandle,
    stats: Arc<InferenceStats>,
    annotator: Annotator,
    source: Option<Box<dyn FrameSource>>,
    stage: Option<InferenceStage>,
    sampler: Sampler,
    governor: RateGovernor,
    emitted: u64,
    encode_failures: u64,
    pace_due: bool,
    error: Option<PipelineError>,
}

impl FrameStream {
    /// Create an idle stream. Nothing is opened until `start`.
    pub fn new(detector: SharedDetector, config: PipelineConfig, telemetry: TelemetryEmitter) -> Self {
        let annotator = Annotator::new(&config);
        let governor = RateGovernor::new(config.fps_window);
        Self {
            config,
            detector,
            telemetry,
            cancel: CancelToken::new(),
            state: StateHandle::new(),
            stats: Arc::new(InferenceStats::new()),
            annotator,
            source: None,
            stage: None,
            sampler: Sampler::new(None),
            governor,
            emitted: 0,
            encode_failures: 0,
            pace_due: false,
            error: None,
        }
    }

    /// Open `uri` and start a stream in one step.
    pub fn open(
        uri: &str,
        detector: SharedDetector,
        config: PipelineConfig,
        telemetry: TelemetryEmitter,
    ) -> Result<Self, PipelineError> {
        let mut stream = Self::new(detector, config, telemetry);
        stream.start(uri)?;
        Ok(stream)
    }

    /// Roll this stream's counters into `parent` as well.
    pub fn with_parent_stats(mut self, parent: Arc<InferenceStats>) -> Self {
        self.stats = Arc::new(InferenceStats::child_of(parent));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn start(&mut self, uri: &str) -> Result<(), PipelineError> {
        self.ensure_idle()?;
        self.state.set(PipelineState::Opening);
        match open_source(uri) {
            Ok(source) => self.run_with(source),
            Err(err) => {
                log::error!("pipeline failed to open {:?}: {}", uri, err);
                self.state.set(PipelineState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Start from an already opened source.
    pub fn start_with(&mut self, source: Box<dyn FrameSource>) -> Result<(), PipelineError> {
        self.ensure_idle()?;
        self.state.set(PipelineState::Opening);
        self.run_with(source)
    }

    fn ensure_idle(&self) -> Result<(), PipelineError> {
        match self.state.get() {
            PipelineState::Idle => Ok(()),
            other => Err(PipelineError::AlreadyStarted(format!("{:?}", other))),
        }
    }

    fn run_with(&mut self, source: Box<dyn FrameSource>) -> Result<(), PipelineError> {
        let stage = match InferenceStage::spawn(self.detector.clone(), &self.config, self.stats.clone()) {
            Ok(stage) => stage,
            Err(err) => {
                log::error!("pipeline failed to start inference: {}", err);
                drop(source);
                self.state.set(PipelineState::Failed(err.to_string()));
                return Err(err);
            }
        };
        self.sampler = Sampler::new(source.native_fps());
        self.governor = RateGovernor::new(self.config.fps_window);
        log::info!(
            "pipeline running: {} (target {} fps, interval {})",
            source.uri(),
            self.config.rate.get(),
            sampling_interval(source.native_fps(), self.config.rate.get())
        );
        self.source = Some(source);
        self.stage = Some(stage);
        self.state.set(PipelineState::Running);
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// This stream's inference counters.
    pub fn stats(&self) -> InferenceSnapshot {
        self.stats.snapshot()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Source frames examined by the sampler so far.
    pub fn frames_read(&self) -> u64 {
        self.sampler.position()
    }

    /// The error that moved the stream to `Failed`.
    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    /// Advance until the next frame is emitted or the stream ends.
    pub fn next_frame(&mut self) -> Option<EmittedFrame> {
        loop {
            let state = self.state.get();
            if !matches!(state, PipelineState::Running | PipelineState::Draining) {
                return None;
            }
            if self.cancel.is_cancelled() {
                log::info!("pipeline cancelled");
                self.finish(None);
                return None;
            }
            if self.pace_due {
                self.pace_due = false;
                if !self.pace() {
                    continue;
                }
            }

            if state == PipelineState::Draining {
                let result = self
                    .stage
                    .as_ref()
                    .and_then(|stage| stage.result_timeout(DRAIN_POLL));
                match result {
                    Some(result) => {
                        self.pace_due = true;
                        if let Some(frame) = self.emit(result) {
                            return Some(frame);
                        }
                    }
                    None => {
                        if self.stage.as_ref().map_or(true, InferenceStage::is_idle) {
                            self.finish(None);
                            return None;
                        }
                    }
                }
                continue;
            }

            let read = match self.source.as_mut() {
                Some(source) => source.next_frame(),
                None => Ok(None),
            };
            match read {
                Ok(Some(frame)) => {
                    if !self.sampler.admit(self.config.rate.get()) {
                        continue;
                    }
                    let result = self.stage.as_ref().and_then(|stage| {
                        stage.submit(frame);
                        stage.try_result()
                    });
                    self.pace_due = true;
                    if let Some(frame) = result.and_then(|result| self.emit(result)) {
                        return Some(frame);
                    }
                }
                Ok(None) => {
                    log::info!(
                        "end of stream after {} frames; draining inference",
                        self.sampler.position()
                    );
                    self.state.set(PipelineState::Draining);
                }
                Err(err) => {
                    self.finish(Some(err));
                    return None;
                }
            }
        }
    }

    fn emit(&mut self, result: DetectionResult) -> Option<EmittedFrame> {
        let running_fps = self.governor.record();
        match self.annotator.annotate(&result, running_fps, self.emitted) {
            Ok(annotated) => {
                self.telemetry.emit_all(annotated.events);
                let frame = EmittedFrame {
                    index: result.frame_index(),
                    ordinal: self.emitted,
                    overlays: annotated.overlays,
                    detection_failed: result.failed,
                    chunk: frame_chunk(&annotated.jpeg),
                };
                self.emitted += 1;
                Some(frame)
            }
            Err(err) => {
                self.encode_failures += 1;
                log::warn!("skipping frame {}: {}", result.frame_index(), err);
                None
            }
        }
    }

    /// Advisory sleep toward the target rate. Returns false when cancelled
    /// part-way.
    fn pace(&self) -> bool {
        let deadline = Instant::now() + pacing_delay(self.config.rate.get());
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(PACE_SLICE));
        }
    }

    /// Join the worker, release the source, then publish the terminal state.
    fn finish(&mut self, error: Option<PipelineError>) {
        if self.state.get().is_terminal() {
            return;
        }
        if error.is_none() {
            self.state.set(PipelineState::Draining);
        }
        if let Some(stage) = self.stage.take() {
            stage.shutdown();
        }
        let frames_read = self.source.as_ref().map_or(0, |source| source.frames_read());
        drop(self.source.take());

        let stats = self.stats.snapshot();
        log::info!(
            "pipeline closed: {} frames read, {} emitted, {} submitted, {} dropped, {} detector failures, {} encode failures",
            frames_read,
            self.emitted,
            stats.submitted,
            stats.dropped,
            stats.failures,
            self.encode_failures
        );
        match error {
            Some(err) => {
                log::error!("pipeline failed: {}", err);
                self.state.set(PipelineState::Failed(err.to_string()));
                self.error = Some(err);
            }
            None => self.state.set(PipelineState::Closed),
        }
    }
}

impl Iterator for FrameStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.next_frame().map(|frame| frame.chunk)
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if matches!(
            self.state.get(),
            PipelineState::Running | PipelineState::Draining | PipelineState::Opening
        ) {
            self.finish(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateControl;
    use crate::detect::{share_detector, ScriptedBackend};

    fn config() -> PipelineConfig {
        PipelineConfig {
            rate: RateControl::new(200).expect("rate"),
            input_width: 32,
            input_height: 24,
            ..PipelineConfig::default()
        }
    }

    fn detector() -> SharedDetector {
        share_detector(Box::new(ScriptedBackend::new(Vec::new())))
    }

    #[test]
    fn idle_stream_yields_nothing() {
        let mut stream = FrameStream::new(detector(), config(), TelemetryEmitter::disabled());
        assert_eq!(stream.state(), PipelineState::Idle);
        assert!(stream.next().is_none());
    }

    #[test]
    fn missing_source_fails_from_opening() {
        let mut stream = FrameStream::new(detector(), config(), TelemetryEmitter::disabled());
        let err = stream.start("/no/such/video.mp4").unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
        assert!(matches!(stream.state(), PipelineState::Failed(_)));
        assert!(stream.next().is_none());
    }

    #[test]
    fn finite_source_emits_every_frame_then_closes() {
        let mut stream = FrameStream::open(
            "stub://t?frames=6&fps=0&width=32&height=24",
            detector(),
            config(),
            TelemetryEmitter::disabled(),
        )
        .expect("open");
        let indices: Vec<u64> = std::iter::from_fn(|| stream.next_frame())
            .map(|f| f.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(stream.state(), PipelineState::Closed);
        assert_eq!(stream.stats().processed, 6);
    }

    #[test]
    fn decode_error_fails_the_stream() {
        let mut stream = FrameStream::open(
            "stub://t?fail_at=3&width=32&height=24",
            detector(),
            config(),
            TelemetryEmitter::disabled(),
        )
        .expect("open");
        while stream.next().is_some() {}
        assert!(matches!(stream.state(), PipelineState::Failed(_)));
        assert!(matches!(stream.error(), Some(PipelineError::DecodeError(_))));
    }

    #[test]
    fn cancel_closes_an_endless_stream() {
        let mut stream = FrameStream::open(
            "stub://t?width=32&height=24",
            detector(),
            config(),
            TelemetryEmitter::disabled(),
        )
        .expect("open");
        let token = stream.cancel_token();
        assert!(stream.next().is_some());
        token.cancel();
        assert!(stream.next().is_none());
        assert_eq!(stream.state(), PipelineState::Closed);
    }

    #[test]
    fn start_with_runs_an_opened_source() {
        let source = open_source("stub://t?frames=3&fps=0&width=32&height=24").expect("source");
        let mut stream = FrameStream::new(detector(), config(), TelemetryEmitter::disabled());
        stream.start_with(source).expect("start");
        assert_eq!(stream.by_ref().count(), 3);
        assert_eq!(stream.state(), PipelineState::Closed);
    }

    #[test]
    fn second_start_is_rejected_without_disturbing_the_stream() {
        let mut stream = FrameStream::open(
            "stub://t?frames=4&fps=0&width=32&height=24",
            detector(),
            config(),
            TelemetryEmitter::disabled(),
        )
        .expect("open");
        let err = stream.start("stub://other").unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyStarted(_)), "{}", err);
        assert!(!err.is_fatal());

        let again = open_source("stub://t?frames=1").expect("source");
        assert!(matches!(
            stream.start_with(again),
            Err(PipelineError::AlreadyStarted(_))
        ));
        assert_eq!(stream.by_ref().count(), 4);

        let err = stream.start("stub://other").unwrap_err();
        assert_eq!(err.to_string(), "stream already started (state: Closed)");
    }
}
