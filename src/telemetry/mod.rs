//! Side-channel telemetry.
//!
//! Pipelines emit typed events through a bounded channel; one publisher
//! thread per service delivers them to a sink. Emission never blocks and
//! never fails: a full channel drops the event, a failing sink is logged.

mod hub;
mod mqtt;
mod sinks;

pub use hub::EventHub;
pub use mqtt::{MqttSink, MqttSinkConfig};
pub use sinks::{FanoutSink, LogSink, RecordingSink};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use serde_json::json;

use crate::error::PipelineError;

pub const LOG_CHANNEL: &str = "log_update";
pub const CONFIDENCE_CHANNEL: &str = "confidence";

const PUBLISHER_POLL: Duration = Duration::from_millis(50);

/// One best-effort notification about pipeline progress.
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryEvent {
    LogMessage { message: String },
    ConfidenceSample { frame: u64, confidence: f32 },
    ThroughputSample { fps: f64 },
}

impl TelemetryEvent {
    pub fn log(message: impl Into<String>) -> Self {
        Self::LogMessage {
            message: message.into(),
        }
    }

    /// Channel name the browser client listens on.
    pub fn channel(&self) -> &'static str {
        match self {
            TelemetryEvent::LogMessage { .. } | TelemetryEvent::ThroughputSample { .. } => {
                LOG_CHANNEL
            }
            TelemetryEvent::ConfidenceSample { .. } => CONFIDENCE_CHANNEL,
        }
    }

    /// JSON body published on `channel()`.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            TelemetryEvent::LogMessage { message } => json!({ "message": message }),
            TelemetryEvent::ConfidenceSample { frame, confidence } => json!({
                "frame": frame,
                "confidence": round2(*confidence),
            }),
            TelemetryEvent::ThroughputSample { fps } => {
                json!({ "message": format!("Actual FPS: {:.1}", fps) })
            }
        }
    }
}

fn round2(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}

/// Delivery target for telemetry events.
pub trait TelemetrySink: Send {
    fn name(&self) -> &'static str;

    fn deliver(&mut self, event: &TelemetryEvent) -> Result<(), PipelineError>;
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn deliver(&mut self, event: &TelemetryEvent) -> Result<(), PipelineError> {
        (**self).deliver(event)
    }
}

/// Counters shared by emitters and the publisher thread.
#[derive(Debug, Default)]
pub struct TelemetryStats {
    emitted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub emitted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl TelemetryStats {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable, non-blocking handle used by pipelines.
#[derive(Clone, Debug)]
pub struct TelemetryEmitter {
    tx: Option<Sender<TelemetryEvent>>,
    stats: Arc<TelemetryStats>,
}

impl TelemetryEmitter {
    /// Emitter that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            stats: Arc::new(TelemetryStats::default()),
        }
    }

    pub fn emit(&self, event: TelemetryEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!(
                    "telemetry channel full; dropped {} event (total dropped: {})",
                    event.channel(),
                    dropped
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = TelemetryEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn stats(&self) -> TelemetrySnapshot {
        self.stats.snapshot()
    }
}

/// Publisher thread that owns the sink.
pub struct TelemetryPublisher {
    emitter: TelemetryEmitter,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TelemetryPublisher {
    pub fn spawn<S: TelemetrySink + 'static>(sink: S, capacity: usize) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let stats = Arc::new(TelemetryStats::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_stats = stats.clone();
        let thread_shutdown = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("telemetry-publisher".into())
            .spawn(move || run_publisher(sink, rx, thread_stats, thread_shutdown))
            .context("spawn telemetry publisher")?;

        Ok(Self {
            emitter: TelemetryEmitter {
                tx: Some(tx),
                stats,
            },
            shutdown,
            join: Some(join),
        })
    }

    pub fn emitter(&self) -> TelemetryEmitter {
        self.emitter.clone()
    }

    pub fn stats(&self) -> TelemetrySnapshot {
        self.emitter.stats()
    }

    /// Deliver what is already queued, then join the publisher thread.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("telemetry publisher panicked");
            }
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run_publisher<S: TelemetrySink>(
    mut sink: S,
    rx: Receiver<TelemetryEvent>,
    stats: Arc<TelemetryStats>,
    shutdown: Arc<AtomicBool>,
) {
    log::debug!("telemetry publisher started (sink: {})", sink.name());
    while !shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(PUBLISHER_POLL) {
            Ok(event) => deliver(&mut sink, &event, &stats),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for event in rx.try_iter() {
        deliver(&mut sink, &event, &stats);
    }
    log::debug!("telemetry publisher stopped");
}

fn deliver<S: TelemetrySink>(sink: &mut S, event: &TelemetryEvent, stats: &TelemetryStats) {
    match sink.deliver(event) {
        Ok(()) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("telemetry sink {} failed: {}", sink.name(), err);
        }
    }
}
