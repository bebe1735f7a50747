//! MQTT telemetry sink.
//!
//! Publishes each event's JSON payload to `{prefix}/{channel}` with QoS 0.
//! `try_publish` keeps the publisher thread from blocking on a slow broker;
//! the connection event loop runs on its own thread and reconnects after
//! errors until the sink is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};

use super::{TelemetryEvent, TelemetrySink};
use crate::error::PipelineError;

const MQTT_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct MqttSinkConfig {
    /// `host:port`; the port defaults to 1883.
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
}

pub struct MqttSink {
    client: Client,
    topic_prefix: String,
    shutdown: Arc<AtomicBool>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(config: &MqttSinkConfig) -> Result<Self> {
        let (host, port) = parse_broker(&config.broker)?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, MQTT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let connection_handle = std::thread::Builder::new()
            .name("telemetry-mqtt".into())
            .spawn(move || drive_connection(connection, &thread_shutdown, RECONNECT_BACKOFF))
            .context("spawn MQTT connection thread")?;

        log::info!(
            "MQTT telemetry enabled (broker: {}, prefix: {})",
            config.broker,
            config.topic_prefix
        );
        Ok(Self {
            client,
            topic_prefix: config.topic_prefix.trim_end_matches('/').to_string(),
            shutdown,
            connection_handle: Some(connection_handle),
        })
    }

    pub fn topic_for(&self, event: &TelemetryEvent) -> String {
        format!("{}/{}", self.topic_prefix, event.channel())
    }
}

/// Runs the event loop until shutdown or until the client side goes away.
/// Polling again after an error makes rumqttc reconnect.
fn drive_connection(mut connection: Connection, shutdown: &AtomicBool, backoff: Duration) {
    for event in connection.iter() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match event {
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                log::warn!("MQTT connection error: {}. Reconnecting...", e);
                if !wait_backoff(shutdown, backoff) {
                    break;
                }
            }
        }
    }
    log::debug!("MQTT connection loop stopped");
}

/// Sleeps for `backoff`; false when shutdown was requested meanwhile.
fn wait_backoff(shutdown: &AtomicBool, backoff: Duration) -> bool {
    let deadline = Instant::now() + backoff;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        std::thread::sleep(BACKOFF_SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
    !shutdown.load(Ordering::SeqCst)
}

impl TelemetrySink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&mut self, event: &TelemetryEvent) -> Result<(), PipelineError> {
        let payload = serde_json::to_vec(&event.payload())
            .map_err(|e| PipelineError::TelemetryDeliveryError(e.to_string()))?;
        self.client
            .try_publish(self.topic_for(event), QoS::AtMostOnce, false, payload)
            .map_err(|e| PipelineError::TelemetryDeliveryError(format!("mqtt publish: {}", e)))
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect failed: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let trimmed = broker.trim().trim_start_matches("mqtt://");
    if trimmed.is_empty() {
        return Err(anyhow!("MQTT broker address is empty"));
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| anyhow!("invalid MQTT broker port in {:?}", broker))?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), 1883)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_parsing() {
        assert_eq!(parse_broker("localhost").expect("host"), ("localhost".into(), 1883));
        assert_eq!(
            parse_broker("mqtt://10.0.0.5:1884").expect("host"),
            ("10.0.0.5".into(), 1884)
        );
        assert!(parse_broker("host:notaport").is_err());
        assert!(parse_broker("  ").is_err());
    }

    #[test]
    fn backoff_ends_early_on_shutdown() {
        let shutdown = AtomicBool::new(false);
        assert!(wait_backoff(&shutdown, Duration::from_millis(20)));
        shutdown.store(true, Ordering::SeqCst);
        let started = Instant::now();
        assert!(!wait_backoff(&shutdown, Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn refused_broker_keeps_reconnecting_until_drop() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .expect("free port")
            .port();
        let sink = MqttSink::connect(&MqttSinkConfig {
            broker: format!("127.0.0.1:{}", port),
            topic_prefix: "roadwatch/".into(),
            client_id: "roadwatch-test".into(),
        })
        .expect("connect");
        assert_eq!(sink.topic_for(&TelemetryEvent::log("x")), "roadwatch/log_update");

        std::thread::sleep(Duration::from_millis(300));
        let alive = sink
            .connection_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        assert!(alive, "connection loop exited after the first error");

        let started = Instant::now();
        drop(sink);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
