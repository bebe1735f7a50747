//! Overlay rendering, side-by-side composition and JPEG encoding.
//!
//! `Annotator::annotate` is pure: the same result, FPS and ordinal always
//! produce the same bytes and the same telemetry events.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, Rgb, RgbImage};

use crate::config::PipelineConfig;
use crate::detect::{ClassLabels, Detection, DetectionResult};
use crate::error::PipelineError;
use crate::telemetry::TelemetryEvent;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const FPS_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;
const LABEL_OFFSET: i32 = 8;
const FPS_ORIGIN: (i32, i32) = (10, 25);
const FPS_SCALE: i32 = 2;

/// One encoded output frame plus the telemetry it produced.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub jpeg: Vec<u8>,
    /// Label texts drawn, in detector order.
    pub overlays: Vec<String>,
    pub events: Vec<TelemetryEvent>,
}

#[derive(Clone, Debug)]
pub struct Annotator {
    confidence_floor: f32,
    labels: ClassLabels,
    jpeg_quality: u8,
    log_interval: u64,
}

impl Annotator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            confidence_floor: config.confidence_floor,
            labels: config.labels.clone(),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            log_interval: config.log_interval.max(1),
        }
    }

    /// Detections that pass the floor. Applied here even though detectors
    /// filter too.
    pub fn visible<'a>(&self, detections: &'a [Detection]) -> Vec<&'a Detection> {
        detections
            .iter()
            .filter(|d| d.confidence >= self.confidence_floor)
            .collect()
    }

    /// `"{class} ({confidence:.2})"`, with `unknown` for ids outside the table.
    pub fn label_text(&self, detection: &Detection) -> String {
        format!(
            "{} ({:.2})",
            self.labels.name(detection.class_id),
            detection.confidence
        )
    }

    /// Render `result` as original | annotated, stamp the running FPS and
    /// encode. `ordinal` counts emitted frames and drives the log interval.
    pub fn annotate(
        &self,
        result: &DetectionResult,
        running_fps: f64,
        ordinal: u64,
    ) -> Result<AnnotatedFrame, PipelineError> {
        let original = result.frame.to_rgb_image();
        let mut annotated = original.clone();
        let log_this_frame = ordinal % self.log_interval == 0;

        let mut overlays = Vec::new();
        let mut events = Vec::new();
        for detection in self.visible(&result.detections) {
            let text = self.label_text(detection);
            let bbox = detection.bbox.clamped(annotated.width(), annotated.height());
            let (x1, y1) = (bbox.x1.round() as i32, bbox.y1.round() as i32);
            draw_rectangle(
                &mut annotated,
                x1,
                y1,
                bbox.x2.round() as i32,
                bbox.y2.round() as i32,
                BOX_COLOR,
            );
            draw_text(
                &mut annotated,
                x1,
                (y1 - LABEL_OFFSET - GLYPH_HEIGHT).max(0),
                &text,
                1,
                BOX_COLOR,
            );
            if log_this_frame {
                events.push(TelemetryEvent::log(format!(
                    "{} detected ({:.2})",
                    self.labels.name(detection.class_id),
                    detection.confidence
                )));
                events.push(TelemetryEvent::ConfidenceSample {
                    frame: ordinal,
                    confidence: detection.confidence,
                });
            }
            overlays.push(text);
        }
        events.push(TelemetryEvent::ThroughputSample { fps: running_fps });

        draw_text(
            &mut annotated,
            FPS_ORIGIN.0,
            FPS_ORIGIN.1 - GLYPH_HEIGHT * FPS_SCALE,
            &format!("FPS: {:.1}", running_fps),
            FPS_SCALE,
            FPS_COLOR,
        );

        let combined = side_by_side(&original, &annotated);
        let jpeg = encode_jpeg(&combined, self.jpeg_quality)?;
        Ok(AnnotatedFrame {
            jpeg,
            overlays,
            events,
        })
    }
}

/// Horizontal concatenation of two equally sized images.
pub fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let height = left.height().max(right.height());
    let mut combined = RgbImage::new(left.width() + right.width(), height);
    imageops::replace(&mut combined, left, 0, 0);
    imageops::replace(&mut combined, right, i64::from(left.width()), 0);
    combined
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| PipelineError::EncodeError(format!("JPEG encode failed: {}", err)))?;
    Ok(buffer)
}

/// Inclusive fill, clipped to the image before iterating.
fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let max_x = image.width() as i64 - 1;
    let max_y = image.height() as i64 - 1;
    let (left, right) = (i64::from(left).max(0), i64::from(right).min(max_x));
    let (top, bottom) = (i64::from(top).max(0), i64::from(bottom).min(max_y));
    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// Rectangle outline `BOX_THICKNESS` pixels wide, growing inwards.
fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if right < left || bottom < top {
        return;
    }
    let t = BOX_THICKNESS - 1;
    fill_rect(image, left, top, right, top.saturating_add(t), color);
    fill_rect(image, left, bottom.saturating_sub(t), right, bottom, color);
    fill_rect(image, left, top, left.saturating_add(t), bottom, color);
    fill_rect(image, right.saturating_sub(t), top, right, bottom, color);
}

/// 5x7 bitmap text, upper-cased; each glyph pixel becomes a `scale` square.
fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        let px = x + col * scale;
                        let py = y + row as i32 * scale;
                        fill_rect(image, px, py, px + scale - 1, py + scale - 1, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
