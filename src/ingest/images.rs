//! Still-image directory source. Files are read in sorted name order; the
//! native rate is unknown, so the sampler keeps every frame.

use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::frame::Frame;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub(crate) struct ImageDirSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageDirSource {
    pub(crate) fn open(dir: &Path) -> Result<Self, PipelineError> {
        let uri = dir.display().to_string();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| PipelineError::source_unavailable(&uri, e.to_string()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| PipelineError::source_unavailable(&uri, e.to_string()))?
                .path();
            if path.is_file() && has_image_extension(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(PipelineError::source_unavailable(&uri, "directory contains no images"));
        }
        files.sort();
        log::info!("FileSource: {} images in {}", files.len(), uri);
        Ok(Self { files, next: 0 })
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        let image = image::open(path)
            .map_err(|e| PipelineError::DecodeError(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        let frame = Frame::from_image(image, self.next as u64);
        self.next += 1;
        Ok(Some(frame))
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.next as u64
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}
