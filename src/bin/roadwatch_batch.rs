//! roadwatch-batch - run the pipeline offline and keep the annotated frames
//!
//! Reads a source to the end (or `--max-frames`) at the given target rate and
//! writes each emitted side-by-side frame as `frame_<index>.jpg`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;

use roadwatch::config::{
    DetectorSettings, DEFAULT_CONFIDENCE_FLOOR, DEFAULT_TARGET_FPS, DEFAULT_TELEMETRY_CAPACITY,
};
use roadwatch::pipeline::multiplex::chunk_body;
use roadwatch::telemetry::LogSink;
use roadwatch::{
    build_backend, share_detector, FrameStream, PipelineConfig, RateControl, TelemetryPublisher,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Source URI: `stub://...`, an image directory or a video file.
    #[arg(long, env = "ROADWATCH_SOURCE")]
    source: String,
    /// Output directory for annotated frames.
    #[arg(long, default_value = "roadwatch_out")]
    out: PathBuf,
    /// Target output rate; also paces the run.
    #[arg(long, default_value_t = DEFAULT_TARGET_FPS)]
    fps: u32,
    /// Minimum confidence for a detection to be drawn.
    #[arg(long, default_value_t = DEFAULT_CONFIDENCE_FLOOR)]
    confidence: f32,
    /// Detector backend (`stub` or `tract`).
    #[arg(long, env = "ROADWATCH_DETECTOR", default_value = "stub")]
    detector: String,
    /// ONNX model for the `tract` backend.
    #[arg(long, env = "ROADWATCH_MODEL_PATH")]
    model: Option<PathBuf>,
    /// Stop after this many emitted frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.confidence) {
        return Err(anyhow!("confidence must be within [0, 1]"));
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("create output directory {}", args.out.display()))?;

    let settings = DetectorSettings {
        backend: args.detector.trim().to_lowercase(),
        model_path: args.model.clone(),
        confidence_floor: args.confidence,
        ..DetectorSettings::default()
    };
    let detector = share_detector(build_backend(&settings));
    let config = PipelineConfig {
        rate: RateControl::new(args.fps)?,
        confidence_floor: args.confidence,
        ..PipelineConfig::default()
    };

    let publisher = TelemetryPublisher::spawn(LogSink, DEFAULT_TELEMETRY_CAPACITY)?;
    let mut stream = FrameStream::open(&args.source, detector, config, publisher.emitter())?;

    let mut written = 0u64;
    while let Some(frame) = stream.next_frame() {
        let jpeg = chunk_body(&frame.chunk).ok_or_else(|| anyhow!("malformed frame chunk"))?;
        let path = args.out.join(format!("frame_{:06}.jpg", frame.index));
        fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))?;
        written += 1;
        if args.max_frames.is_some_and(|max| written >= max) {
            break;
        }
    }

    let stats = stream.stats();
    let failure = stream.error().map(|err| err.to_string());
    drop(stream);
    publisher.stop();

    log::info!(
        "wrote {} frames to {} ({} submitted, {} dropped, {} detector failures)",
        written,
        args.out.display(),
        stats.submitted,
        stats.dropped,
        stats.failures
    );
    match failure {
        Some(reason) => Err(anyhow!("pipeline failed: {}", reason)),
        None => Ok(()),
    }
}
