//! Local frame source.
//!
//! `FileSource` picks a backend from the URI:
//! - `stub://name?frames=N&fps=F&width=W&height=H&fail_at=K` synthesises
//!   frames (all parameters optional; `fps=0` reports an unknown rate)
//! - a directory is read as an ordered sequence of still images
//! - any other existing path is decoded with FFmpeg when built with
//!   `ingest-file-ffmpeg`
//!
//! Remote URL schemes are rejected.

use std::path::Path;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::images::ImageDirSource;
use super::FrameSource;
use crate::error::PipelineError;
use crate::frame::{Frame, CHANNELS};

const STUB_SCHEME: &str = "stub://";
const DEFAULT_STUB_FPS: f64 = 30.0;
const DEFAULT_STUB_WIDTH: u32 = 640;
const DEFAULT_STUB_HEIGHT: u32 = 480;
/// Largest synthetic frame side, so `width * height * 3` always fits a `usize`.
const MAX_STUB_DIMENSION: u32 = 8192;

/// Local frame source.
pub struct FileSource {
    uri: String,
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    Images(ImageDirSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn open(uri: &str) -> Result<Self, PipelineError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(PipelineError::source_unavailable(uri, "no video source configured"));
        }
        if uri.starts_with(STUB_SCHEME) {
            let spec = SyntheticSpec::parse(uri)?;
            return Ok(Self {
                uri: uri.to_string(),
                backend: FileBackend::Synthetic(SyntheticSource::new(spec)),
            });
        }
        if uri.contains("://") {
            return Err(PipelineError::source_unavailable(
                uri,
                "only local paths and stub:// sources are supported",
            ));
        }

        let path = Path::new(uri);
        let metadata = std::fs::metadata(path)
            .map_err(|e| PipelineError::source_unavailable(uri, e.to_string()))?;
        let backend = if metadata.is_dir() {
            FileBackend::Images(ImageDirSource::open(path)?)
        } else {
            open_video_file(uri)?
        };
        Ok(Self {
            uri: uri.to_string(),
            backend,
        })
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_video_file(uri: &str) -> Result<FileBackend, PipelineError> {
    Ok(FileBackend::Ffmpeg(FfmpegFileSource::open(uri)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_video_file(uri: &str) -> Result<FileBackend, PipelineError> {
    Err(PipelineError::source_unavailable(
        uri,
        "video file decoding requires the ingest-file-ffmpeg feature",
    ))
}

impl FrameSource for FileSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn native_fps(&self) -> Option<f64> {
        match &self.backend {
            FileBackend::Synthetic(source) => source.native_fps(),
            FileBackend::Images(_) => None,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.native_fps(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
            FileBackend::Images(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    fn frames_read(&self) -> u64 {
        match &self.backend {
            FileBackend::Synthetic(source) => source.frame_count,
            FileBackend::Images(source) => source.frames_read(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.frames_read(),
        }
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        log::debug!(
            "released source {} after {} frames",
            self.uri,
            self.frames_read()
        );
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// Parameters of a `stub://` source.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticSpec {
    pub name: String,
    /// Total frames; `None` streams forever.
    pub frames: Option<u64>,
    /// Reported rate; `0` means unknown.
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Fail with a decode error instead of producing this frame index.
    pub fail_at: Option<u64>,
}

impl SyntheticSpec {
    pub fn parse(uri: &str) -> Result<Self, PipelineError> {
        let rest = uri
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| PipelineError::source_unavailable(uri, "not a stub:// uri"))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, query),
            None => (rest, ""),
        };
        let mut spec = SyntheticSpec {
            name: name.to_string(),
            frames: None,
            fps: DEFAULT_STUB_FPS,
            width: DEFAULT_STUB_WIDTH,
            height: DEFAULT_STUB_HEIGHT,
            fail_at: None,
        };
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let invalid =
                || PipelineError::source_unavailable(uri, format!("invalid {} value {:?}", key, value));
            match key {
                "frames" => spec.frames = Some(value.parse().map_err(|_| invalid())?),
                "fps" => {
                    let fps: f64 = value.parse().map_err(|_| invalid())?;
                    if !fps.is_finite() || fps < 0.0 {
                        return Err(invalid());
                    }
                    spec.fps = fps;
                }
                "width" => spec.width = value.parse().map_err(|_| invalid())?,
                "height" => spec.height = value.parse().map_err(|_| invalid())?,
                "fail_at" => spec.fail_at = Some(value.parse().map_err(|_| invalid())?),
                _ => {
                    return Err(PipelineError::source_unavailable(
                        uri,
                        format!("unknown parameter {:?}", key),
                    ))
                }
            }
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(PipelineError::source_unavailable(uri, "frame size must be non-zero"));
        }
        if spec.width > MAX_STUB_DIMENSION || spec.height > MAX_STUB_DIMENSION {
            return Err(PipelineError::source_unavailable(
                uri,
                format!("frame size exceeds {} pixels per side", MAX_STUB_DIMENSION),
            ));
        }
        Ok(spec)
    }
}

struct SyntheticSource {
    spec: SyntheticSpec,
    frame_count: u64,
}

impl SyntheticSource {
    fn new(spec: SyntheticSpec) -> Self {
        log::info!(
            "FileSource: synthetic stream {} ({}x{})",
            spec.name,
            spec.width,
            spec.height
        );
        Self {
            spec,
            frame_count: 0,
        }
    }

    fn native_fps(&self) -> Option<f64> {
        if self.spec.fps > 0.0 {
            Some(self.spec.fps)
        } else {
            None
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        let index = self.frame_count;
        if self.spec.frames.is_some_and(|total| index >= total) {
            return Ok(None);
        }
        if self.spec.fail_at == Some(index) {
            return Err(PipelineError::DecodeError(format!(
                "synthetic stream {} failed at frame {}",
                self.spec.name, index
            )));
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels(index);
        Frame::from_rgb(pixels, self.spec.width, self.spec.height, index).map(Some)
    }

    /// Diagonal gradient that shifts with the frame index.
    fn generate_pixels(&self, index: u64) -> Vec<u8> {
        let (width, height) = (self.spec.width as usize, self.spec.height as usize);
        let shift = (index * 4) as usize;
        let mut pixels = vec![0u8; width * height * CHANNELS];
        for (i, px) in pixels.chunks_exact_mut(CHANNELS).enumerate() {
            let (x, y) = (i % width, i / width);
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift / 2) % 256) as u8;
            px[2] = ((x + y) % 256) as u8;
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stub_parameters() {
        let spec = SyntheticSpec::parse("stub://road?frames=12&fps=60&width=64&height=32").expect("spec");
        assert_eq!(spec.name, "road");
        assert_eq!(spec.frames, Some(12));
        assert_eq!(spec.fps, 60.0);
        assert_eq!((spec.width, spec.height), (64, 32));
        assert_eq!(spec.fail_at, None);
    }

    #[test]
    fn rejects_unknown_stub_parameter() {
        let err = SyntheticSpec::parse("stub://x?speed=3").unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[test]
    fn oversized_stub_frames_are_rejected() {
        for uri in [
            "stub://x?width=4294967295&height=4294967295",
            "stub://x?width=8193&height=2",
            "stub://x?width=2&height=100000",
        ] {
            assert!(
                matches!(FileSource::open(uri), Err(PipelineError::SourceUnavailable { .. })),
                "{}",
                uri
            );
        }
        let spec = SyntheticSpec::parse("stub://x?width=8192&height=1").expect("largest side");
        assert_eq!(spec.width, 8192);
    }

    #[test]
    fn empty_uri_is_unavailable() {
        assert!(matches!(
            FileSource::open("  "),
            Err(PipelineError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn missing_path_is_unavailable() {
        assert!(matches!(
            FileSource::open("/definitely/not/here.mp4"),
            Err(PipelineError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn remote_schemes_are_rejected() {
        assert!(FileSource::open("rtsp://camera/stream").is_err());
    }

    #[test]
    fn finite_stub_ends_with_none() {
        let mut source = FileSource::open("stub://t?frames=3&width=8&height=8").expect("open");
        for expected in 0..3 {
            let frame = source.next_frame().expect("frame").expect("some");
            assert_eq!(frame.index, expected);
        }
        assert!(source.next_frame().expect("eof").is_none());
        assert_eq!(source.frames_read(), 3);
    }

    #[test]
    fn zero_fps_reports_unknown_rate() {
        let source = FileSource::open("stub://t?fps=0&width=8&height=8").expect("open");
        assert_eq!(source.native_fps(), None);
    }

    #[test]
    fn fail_at_raises_decode_error() {
        let mut source = FileSource::open("stub://t?fail_at=1&width=8&height=8").expect("open");
        assert!(source.next_frame().expect("frame 0").is_some());
        assert!(matches!(source.next_frame(), Err(PipelineError::DecodeError(_))));
    }

    #[test]
    fn synthetic_frames_differ_between_indices() {
        let mut source = FileSource::open("stub://t?width=16&height=16").expect("open");
        let a = source.next_frame().expect("a").expect("a");
        let b = source.next_frame().expect("b").expect("b");
        assert_ne!(a.pixels(), b.pixels());
    }
}
