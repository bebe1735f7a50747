//! Server-sent-event fan-out for HTTP subscribers.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::{TelemetryEvent, TelemetrySink};
use crate::error::PipelineError;

/// Broadcasts telemetry to `/events` subscribers. Each subscriber has its own
/// bounded buffer; a slow subscriber misses events instead of stalling the
/// publisher, and a disconnected one is pruned on the next delivery.
#[derive(Clone, Debug, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<Sender<String>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Frames arrive already formatted for
    /// `text/event-stream`.
    pub fn subscribe(&self, capacity: usize) -> Receiver<String> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        match self.subscribers.lock() {
            Ok(mut guard) => guard.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// `event: <channel>` / `data: <json>` frame terminated by a blank line.
pub fn sse_frame(event: &TelemetryEvent) -> String {
    format!("event: {}\ndata: {}\n\n", event.channel(), event.payload())
}

impl TelemetrySink for EventHub {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn deliver(&mut self, event: &TelemetryEvent) -> Result<(), PipelineError> {
        let frame = sse_frame(event);
        let mut guard = self
            .subscribers
            .lock()
            .map_err(|_| PipelineError::TelemetryDeliveryError("subscriber list poisoned".into()))?;
        guard.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reach_subscribers_and_dead_ones_are_pruned() {
        let mut hub = EventHub::new();
        let live = hub.subscribe(4);
        let dead = hub.subscribe(4);
        drop(dead);
        assert_eq!(hub.subscriber_count(), 2);

        hub.deliver(&TelemetryEvent::log("crack detected (0.51)"))
            .expect("deliver");
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(
            live.try_recv().expect("frame"),
            "event: log_update\ndata: {\"message\":\"crack detected (0.51)\"}\n\n"
        );
    }

    #[test]
    fn slow_subscriber_misses_events_but_stays() {
        let mut hub = EventHub::new();
        let slow = hub.subscribe(1);
        for fps in [1.0, 2.0, 3.0] {
            hub.deliver(&TelemetryEvent::ThroughputSample { fps }).expect("deliver");
        }
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(slow.try_iter().count(), 1);
    }
}
