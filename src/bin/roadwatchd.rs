//! roadwatchd - live road-hazard detection service
//!
//! This daemon:
//! 1. Loads the detector once and shares it between viewers
//! 2. Serves the annotated stream on `/video_feed`, one pipeline per viewer
//! 3. Accepts target-rate updates on `/set_fps`
//! 4. Publishes detection telemetry to the log, `/events` and optionally MQTT

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use roadwatch::{
    api::{ApiConfig, ApiServer, ApiState},
    build_backend, share_detector,
    telemetry::{EventHub, FanoutSink, LogSink, MqttSink, MqttSinkConfig},
    RoadwatchConfig, TelemetryPublisher,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a `.toml` extension).
    #[arg(long, env = "ROADWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address; overrides the config file.
    #[arg(long)]
    addr: Option<String>,
    /// Source URI or path; overrides the config file.
    #[arg(long)]
    source: Option<String>,
    /// Initial target output rate.
    #[arg(long)]
    fps: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RoadwatchConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.http_addr = addr;
    }
    if let Some(source) = args.source {
        config.source_uri = source;
    }
    if let Some(fps) = args.fps {
        config.pipeline.target_fps = fps;
    }
    let rate = config.rate_control()?;

    let detector = share_detector(build_backend(&config.detector));

    let hub = EventHub::new();
    let mut sink = FanoutSink::new().with(LogSink).with(hub.clone());
    if let Some(broker) = &config.telemetry.mqtt_broker {
        let mqtt = MqttSinkConfig {
            broker: broker.clone(),
            topic_prefix: config.telemetry.mqtt_topic_prefix.clone(),
            client_id: config.telemetry.mqtt_client_id.clone(),
        };
        match MqttSink::connect(&mqtt) {
            Ok(mqtt) => sink = sink.with(mqtt),
            Err(err) => log::warn!("MQTT telemetry disabled: {:#}", err),
        }
    }
    let publisher = TelemetryPublisher::spawn(sink, config.telemetry.capacity)?;

    let state = ApiState::new(
        config.pipeline_config(rate),
        detector,
        publisher.emitter(),
        hub,
    );
    let api_config = ApiConfig {
        addr: config.http_addr.clone(),
        source_uri: config.source_uri.clone(),
    };
    let api_handle = ApiServer::new(api_config, state).spawn()?;
    log::info!(
        "roadwatchd running. source {} at {} fps, http://{}/video_feed",
        config.source_uri,
        config.pipeline.target_fps,
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    api_handle.stop()?;
    publisher.stop();
    Ok(())
}
