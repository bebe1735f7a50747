//! Roadwatch
//!
//! Real-time road-hazard detection over a video source. Frames are sampled
//! toward a target rate, run through a detector on a background worker,
//! annotated with boxes and labels, and streamed to clients as
//! `multipart/x-mixed-replace` JPEG parts. Detection telemetry is published
//! on a side channel.
//!
//! # Module Structure
//!
//! - `frame`: RGB raster type
//! - `ingest`: frame sources (synthetic, image directories, video files)
//! - `detect`: detector backends and detection types
//! - `pipeline`: sampler, inference stage, annotator, rate governor and the
//!   `FrameStream` that ties them together
//! - `telemetry`: side-channel events and sinks
//! - `api`: HTTP transport and control surface
//! - `config`: service configuration

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod telemetry;

pub use config::{PipelineConfig, RateControl, RoadwatchConfig};
pub use detect::{
    build_backend, share_detector, BoundingBox, ClassLabels, Detection, DetectionResult,
    DetectorBackend, SharedDetector,
};
pub use error::PipelineError;
pub use frame::Frame;
pub use ingest::{open_source, FrameSource};
pub use pipeline::{CancelToken, EmittedFrame, FrameStream, PipelineState};
pub use telemetry::{TelemetryEmitter, TelemetryEvent, TelemetryPublisher, TelemetrySink};
