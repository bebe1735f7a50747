//! Local video file decoding with FFmpeg. Frames are converted to RGB24 at
//! native size; the decoder is flushed at end of file so buffered frames are
//! not lost.

use ffmpeg_next as ffmpeg;

use crate::error::PipelineError;
use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    native_fps: Option<f64>,
    frame_count: u64,
    eof_sent: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self, PipelineError> {
        let unavailable = |reason: String| PipelineError::source_unavailable(path, reason);

        ffmpeg::init().map_err(|e| unavailable(format!("initialize ffmpeg: {}", e)))?;
        let input = ffmpeg::format::input(&path)
            .map_err(|e| unavailable(format!("open input: {}", e)))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| unavailable("file has no video track".to_string()))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let native_fps = if rate.numerator() > 0 && rate.denominator() > 0 {
            Some(f64::from(rate))
        } else {
            None
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| unavailable(format!("load decoder parameters: {}", e)))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| unavailable(format!("open video decoder: {}", e)))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| unavailable(format!("create scaler: {}", e)))?;

        log::info!("FileSource: opened {} (ffmpeg)", path);
        Ok(Self {
            path: path.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            native_fps,
            frame_count: 0,
            eof_sent: false,
        })
    }

    pub(crate) fn native_fps(&self) -> Option<f64> {
        self.native_fps
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.frame_count
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        loop {
            if let Some(frame) = self.receive()? {
                return Ok(Some(frame));
            }
            if self.eof_sent {
                return Ok(None);
            }
            match self.next_packet() {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .map_err(|e| self.decode_error("send packet", e))?,
                None => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| self.decode_error("flush decoder", e))?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn next_packet(&mut self) -> Option<ffmpeg::Packet> {
        let stream_index = self.stream_index;
        self.input
            .packets()
            .find(|(stream, _)| stream.index() == stream_index)
            .map(|(_, packet)| packet)
    }

    fn receive(&mut self) -> Result<Option<Frame>, PipelineError> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            // EAGAIN before more input, EOF after the flush.
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .map_err(|e| self.decode_error("scale frame to RGB", e))?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        let frame = Frame::from_rgb(pixels, width, height, self.frame_count)?;
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn decode_error(&self, step: &str, err: ffmpeg::Error) -> PipelineError {
        PipelineError::DecodeError(format!(
            "{}: {} failed after {} frames: {}",
            self.path, step, self.frame_count, err
        ))
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32), PipelineError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data.get(..row_bytes * height as usize).ok_or_else(|| {
            PipelineError::DecodeError("ffmpeg frame is shorter than its dimensions".to_string())
        })?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).ok_or_else(|| {
            PipelineError::DecodeError("ffmpeg frame row is out of bounds".to_string())
        })?);
    }

    Ok((pixels, width, height))
}
