use crate::frame::Frame;

/// Axis-aligned box in pixel coordinates of the inference-resolution frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a centre point and size, the layout YOLO heads emit.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp to `[0, width] x [0, height]`.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One detector output. Immutable once produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    /// Score in `[0, 1]`.
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_id: usize, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A frame paired with the detections produced for it, in detector order.
///
/// Produced once per submitted frame by the inference worker and consumed
/// once by the annotator.
#[derive(Debug)]
pub struct DetectionResult {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    /// Set when the detector failed on this frame and `detections` is empty
    /// for that reason.
    pub failed: bool,
}

impl DetectionResult {
    pub fn new(frame: Frame, detections: Vec<Detection>) -> Self {
        Self {
            frame,
            detections,
            failed: false,
        }
    }

    pub fn failed(frame: Frame) -> Self {
        Self {
            frame,
            detections: Vec::new(),
            failed: true,
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame.index
    }
}

/// Greedy class-aware non-max suppression. Keeps the highest-scoring box of
/// every overlapping group whose IoU exceeds `iou_threshold`.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let suppressed = (0..kept).any(|prev| {
            detections[prev].class_id == detections[index].class_id
                && detections[prev].bbox.iou(&detections[index].bbox) > iou_threshold
        });
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize, confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), class_id, confidence)
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn from_center_converts_to_corners() {
        let b = BoundingBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_eq!(b, BoundingBox::new(40.0, 35.0, 60.0, 45.0));
    }

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let mut dets = vec![
            det(0.0, 0.0, 10.0, 10.0, 0, 0.6),
            det(1.0, 1.0, 11.0, 11.0, 0, 0.9),
            det(1.0, 1.0, 11.0, 11.0, 1, 0.5),
            det(50.0, 50.0, 60.0, 60.0, 0, 0.4),
        ];
        non_max_suppression(&mut dets, 0.45);
        assert_eq!(dets.len(), 3);
        assert_eq!(dets[0].confidence, 0.9);
        assert!(dets.iter().any(|d| d.class_id == 1));
        assert!(dets.iter().any(|d| d.confidence == 0.4));
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(det(0.0, 0.0, 1.0, 1.0, 0, 1.7).confidence, 1.0);
    }
}
