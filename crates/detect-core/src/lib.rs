//! Detection engine boundary.
//!
//! The pipeline only ever sees the [`Detector`] trait: given a BGR8
//! buffer it returns scored boxes. Cross-frame identity is layered on top
//! by [`tracker::Tracker`], so any stateless backend gains a tracking
//! mode. The TorchScript backend lives behind the `with-tch` feature.

pub mod tracker;

#[cfg(feature = "with-tch")]
pub mod torch;

#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;

/// Single detection as produced by a backend, in pixel coordinates of the
/// frame handed to [`Detector::detect`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawDetection {
    /// (x1, y1, x2, y2)
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

/// Stateless per-frame detection capability.
pub trait Detector: Send {
    fn detect(&mut self, bgr: &[u8], width: i32, height: i32) -> anyhow::Result<Vec<RawDetection>>;
}

/// Intersection-over-union of two xyxy boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let left = a[0].max(b[0]);
    let top = a[1].max(b[1]);
    let right = a[2].min(b[2]);
    let bottom = a[3].min(b[3]);
    if right <= left || bottom <= top {
        return 0.0;
    }
    let inter = (right - left) * (bottom - top);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [5.0, 5.0, 25.0, 15.0];
        assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 0.0, 15.0, 10.0];
        // intersection 50, union 150.
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }
}
