use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::detect::ClassLabels;
use crate::error::PipelineError;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:9000";
pub const DEFAULT_SOURCE_URI: &str = "stub://demo";
pub const DEFAULT_DETECTOR_BACKEND: &str = "stub";
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.3;
pub const DEFAULT_INPUT_SIZE: u32 = 416;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_CLASSES: [&str; 3] = ["pothole", "crack", "speed bump"];
pub const DEFAULT_TARGET_FPS: u32 = 30;
pub const DEFAULT_QUEUE_CAPACITY: usize = 30;
pub const DEFAULT_LOG_INTERVAL: u64 = 5;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_FPS_WINDOW: usize = 30;
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 256;
pub const DEFAULT_MQTT_TOPIC_PREFIX: &str = "roadwatch";
pub const DEFAULT_MQTT_CLIENT_ID: &str = "roadwatchd";

#[derive(Debug, Deserialize, Default)]
struct RoadwatchConfigFile {
    http: Option<HttpConfigFile>,
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_floor: Option<f32>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    iou_threshold: Option<f32>,
    classes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    target_fps: Option<u32>,
    inbound_capacity: Option<usize>,
    outbound_capacity: Option<usize>,
    log_interval: Option<u64>,
    jpeg_quality: Option<u8>,
    fps_window: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    capacity: Option<usize>,
    mqtt_broker: Option<String>,
    mqtt_topic_prefix: Option<String>,
    mqtt_client_id: Option<String>,
}

/// Service configuration for `roadwatchd`.
#[derive(Debug, Clone)]
pub struct RoadwatchConfig {
    pub http_addr: String,
    pub source_uri: String,
    pub detector: DetectorSettings,
    pub pipeline: PipelineSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence_floor: f32,
    pub input_width: u32,
    pub input_height: u32,
    pub iou_threshold: f32,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target_fps: u32,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub log_interval: u64,
    pub jpeg_quality: u8,
    pub fps_window: usize,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub capacity: usize,
    /// `host:port` of an MQTT broker; `None` disables the MQTT sink.
    pub mqtt_broker: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: None,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            input_width: DEFAULT_INPUT_SIZE,
            input_height: DEFAULT_INPUT_SIZE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            classes: default_classes(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            log_interval: DEFAULT_LOG_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            fps_window: DEFAULT_FPS_WINDOW,
        }
    }
}

impl RoadwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        let path = config_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(Path::new);
        Self::load_from(path)
    }

    /// Like `load`, with the config file given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadwatchConfigFile) -> Self {
        let http_addr = file
            .http
            .and_then(|http| http.addr)
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let source_uri = file
            .source
            .and_then(|source| source.uri)
            .unwrap_or_else(|| DEFAULT_SOURCE_URI.to_string());

        let detector_file = file.detector.unwrap_or_default();
        let defaults = DetectorSettings::default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(defaults.backend),
            model_path: detector_file.model_path,
            confidence_floor: detector_file
                .confidence_floor
                .unwrap_or(defaults.confidence_floor),
            input_width: detector_file.input_width.unwrap_or(defaults.input_width),
            input_height: detector_file.input_height.unwrap_or(defaults.input_height),
            iou_threshold: detector_file.iou_threshold.unwrap_or(defaults.iou_threshold),
            classes: detector_file.classes.unwrap_or(defaults.classes),
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            target_fps: pipeline_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            inbound_capacity: pipeline_file
                .inbound_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            outbound_capacity: pipeline_file
                .outbound_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            log_interval: pipeline_file.log_interval.unwrap_or(DEFAULT_LOG_INTERVAL),
            jpeg_quality: pipeline_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            fps_window: pipeline_file.fps_window.unwrap_or(DEFAULT_FPS_WINDOW),
        };

        let telemetry_file = file.telemetry.unwrap_or_default();
        let telemetry = TelemetrySettings {
            capacity: telemetry_file
                .capacity
                .unwrap_or(DEFAULT_TELEMETRY_CAPACITY),
            mqtt_broker: telemetry_file.mqtt_broker.filter(|b| !b.trim().is_empty()),
            mqtt_topic_prefix: telemetry_file
                .mqtt_topic_prefix
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            mqtt_client_id: telemetry_file
                .mqtt_client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
        };

        Self {
            http_addr,
            source_uri,
            detector,
            pipeline,
            telemetry,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("ROADWATCH_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.http_addr = addr;
            }
        }
        if let Ok(uri) = std::env::var("ROADWATCH_SOURCE") {
            if !uri.trim().is_empty() {
                self.source_uri = uri;
            }
        }
        if let Ok(backend) = std::env::var("ROADWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_lowercase();
            }
        }
        if let Ok(path) = std::env::var("ROADWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(fps) = std::env::var("ROADWATCH_TARGET_FPS") {
            self.pipeline.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_TARGET_FPS must be a positive integer"))?;
        }
        if let Ok(confidence) = std::env::var("ROADWATCH_CONFIDENCE") {
            self.detector.confidence_floor = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(classes) = std::env::var("ROADWATCH_CLASSES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.detector.classes = parsed;
            }
        }
        if let Ok(broker) = std::env::var("ROADWATCH_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.telemetry.mqtt_broker = Some(broker);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if self.pipeline.target_fps == 0 {
            return Err(anyhow!("target_fps must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_floor) {
            return Err(anyhow!("confidence_floor must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            return Err(anyhow!("iou_threshold must be within [0, 1]"));
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("inference resolution must be non-zero"));
        }
        if self.pipeline.inbound_capacity == 0 || self.pipeline.outbound_capacity == 0 {
            return Err(anyhow!("queue capacities must be greater than zero"));
        }
        if self.pipeline.log_interval == 0 {
            return Err(anyhow!("log_interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.pipeline.fps_window == 0 {
            return Err(anyhow!("fps_window must be greater than zero"));
        }
        if self.telemetry.capacity == 0 {
            return Err(anyhow!("telemetry capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Build the per-pipeline configuration around a shared rate control.
    pub fn pipeline_config(&self, rate: RateControl) -> PipelineConfig {
        PipelineConfig {
            rate,
            confidence_floor: self.detector.confidence_floor,
            input_width: self.detector.input_width,
            input_height: self.detector.input_height,
            inbound_capacity: self.pipeline.inbound_capacity,
            outbound_capacity: self.pipeline.outbound_capacity,
            log_interval: self.pipeline.log_interval,
            jpeg_quality: self.pipeline.jpeg_quality,
            fps_window: self.pipeline.fps_window,
            labels: ClassLabels::new(self.detector.classes.clone()),
        }
    }

    /// Initial rate control seeded from `pipeline.target_fps`.
    pub fn rate_control(&self) -> Result<RateControl> {
        RateControl::new(self.pipeline.target_fps).map_err(|e| anyhow!(e))
    }
}

/// Settings one pipeline run reads. Only the target rate is mutable; it is
/// shared through `RateControl`, the rest is fixed for the run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub rate: RateControl,
    pub confidence_floor: f32,
    pub input_width: u32,
    pub input_height: u32,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub log_interval: u64,
    pub jpeg_quality: u8,
    pub fps_window: usize,
    pub labels: ClassLabels,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        RoadwatchConfig::from_file(RoadwatchConfigFile::default())
            .pipeline_config(RateControl::default())
    }
}

/// Lock-guarded target output rate, shared by the control surface and every
/// running pipeline.
#[derive(Debug, Clone)]
pub struct RateControl {
    fps: Arc<Mutex<u32>>,
}

impl RateControl {
    pub fn new(fps: u32) -> Result<Self, PipelineError> {
        if fps == 0 {
            return Err(PipelineError::InvalidRateConfig(
                "target fps must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            fps: Arc::new(Mutex::new(fps)),
        })
    }

    pub fn get(&self) -> u32 {
        match self.fps.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the target rate. Non-positive or out-of-range values are
    /// rejected and leave the current rate untouched.
    pub fn set(&self, fps: i64) -> Result<u32, PipelineError> {
        if fps <= 0 {
            return Err(PipelineError::InvalidRateConfig(format!(
                "target fps must be positive, got {}",
                fps
            )));
        }
        let fps = u32::try_from(fps).map_err(|_| {
            PipelineError::InvalidRateConfig(format!("target fps {} is out of range", fps))
        })?;
        let mut guard = match self.fps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = fps;
        Ok(fps)
    }
}

impl Default for RateControl {
    fn default() -> Self {
        Self {
            fps: Arc::new(Mutex::new(DEFAULT_TARGET_FPS)),
        }
    }
}

fn default_classes() -> Vec<String> {
    DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect()
}

fn read_config_file(path: &Path) -> Result<RoadwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
