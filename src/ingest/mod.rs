//! Frame sources.
//!
//! - Synthetic `stub://` streams (tests, demos)
//! - Directories of still images, read in file-name order
//! - Local video files (feature: ingest-file-ffmpeg)
//!
//! A source is opened on construction and released when dropped. The
//! pipeline owner drops it only after the inference worker has exited.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub(crate) mod images;

pub use file::{FileSource, SyntheticSpec};

use crate::error::PipelineError;
use crate::frame::Frame;

/// Sequential decoder for one video stream.
pub trait FrameSource: Send {
    /// URI the source was opened from.
    fn uri(&self) -> &str;

    /// Native frame rate, `None` when the container does not report one.
    fn native_fps(&self) -> Option<f64>;

    /// Decode the next frame. `Ok(None)` marks end of stream; an `Err` is a
    /// mid-stream failure that ends the run.
    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError>;

    /// Frames decoded so far.
    fn frames_read(&self) -> u64;
}

/// Open a source by URI. Fails with `SourceUnavailable` when the resource is
/// missing or cannot be opened.
pub fn open_source(uri: &str) -> Result<Box<dyn FrameSource>, PipelineError> {
    let source = FileSource::open(uri)?;
    log::info!(
        "opened source {} (native fps: {})",
        source.uri(),
        source
            .native_fps()
            .map(|fps| format!("{:.2}", fps))
            .unwrap_or_else(|| "unknown".to_string())
    );
    Ok(Box::new(source))
}
