use std::sync::{Arc, Mutex};

use super::{TelemetryEvent, TelemetrySink};
use crate::error::PipelineError;

/// Writes every event to the `log` facade under the `telemetry` target.
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&mut self, event: &TelemetryEvent) -> Result<(), PipelineError> {
        match event {
            TelemetryEvent::ThroughputSample { .. } => {
                log::debug!(target: "telemetry", "{} {}", event.channel(), event.payload())
            }
            _ => log::info!(target: "telemetry", "{} {}", event.channel(), event.payload()),
        }
        Ok(())
    }
}

/// Delivers to every inner sink. Reports the first failure after all sinks
/// have been tried.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: TelemetrySink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    fn deliver(&mut self, event: &TelemetryEvent) -> Result<(), PipelineError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.deliver(event) {
                let err = PipelineError::TelemetryDeliveryError(format!("{}: {}", sink.name(), err));
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Keeps every delivered event in memory. Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TelemetrySink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn deliver(&mut self, event: &TelemetryEvent) -> Result<(), PipelineError> {
        let mut guard = self
            .events
            .lock()
            .map_err(|_| PipelineError::TelemetryDeliveryError("recording sink poisoned".into()))?;
        guard.push(event.clone());
        Ok(())
    }
}
