//! Default tuning values for stamp detection and identification
//!
//! Defaults are tuned for album pages photographed under controlled
//! lighting at roughly 300 DPI equivalent resolution.

/// Stage 1A polygon detection defaults
pub mod polygon {
    /// Minimum candidate area as fraction of image area (0.1%)
    pub const MIN_AREA_RATIO: f64 = 0.001;

    /// Maximum candidate area as fraction of image area (15%)
    pub const MAX_AREA_RATIO: f64 = 0.15;

    /// Triangles are the smallest accepted polygon
    pub const MIN_VERTICES: usize = 3;
    pub const MAX_VERTICES: usize = 4;

    /// Bounding box width/height bounds
    pub const ASPECT_RATIO_MIN: f64 = 0.3;
    pub const ASPECT_RATIO_MAX: f64 = 3.0;

    /// Douglas-Peucker epsilon as fraction of contour perimeter
    pub const APPROX_EPSILON: f64 = 0.02;

    /// Gaussian blur kernel size (must be odd)
    pub const BLUR_KERNEL_SIZE: i32 = 3;

    /// Adaptive threshold neighbourhood (must be odd)
    pub const THRESHOLD_BLOCK_SIZE: i32 = 15;

    /// Constant subtracted from the adaptive mean
    pub const THRESHOLD_C: f64 = 5.0;

    /// Close/open kernel size
    pub const MORPH_KERNEL_SIZE: i32 = 3;

    /// Padding around triangle crops in pixels
    pub const TRIANGLE_PADDING: i32 = 5;

    /// Minimum rectified quadrilateral side in pixels
    pub const MIN_RECTIFIED_SIDE: i32 = 50;
}

/// Stage 1B classifier defaults
pub mod classifier {
    pub const CONFIDENCE_THRESHOLD: f64 = 0.6;

    pub const COLOR_VARIANCE_WEIGHT: f64 = 0.35;
    pub const EDGE_COMPLEXITY_WEIGHT: f64 = 0.30;
    pub const SIZE_WEIGHT: f64 = 0.20;
    pub const PERFORATION_WEIGHT: f64 = 0.15;

    /// Summed Lab channel variance below which a crop counts as blank
    pub const MIN_COLOR_VARIANCE: f64 = 500.0;

    /// Summed Lab variance mapped to a full score
    pub const MAX_EXPECTED_COLOR_VARIANCE: f64 = 10_000.0;

    /// Score for crops under the variance floor
    pub const LOW_COLOR_SCORE: f64 = 0.1;

    pub const MIN_EDGE_DENSITY: f64 = 0.05;

    /// Typical stamps have 5-25% edge pixels
    pub const MAX_EXPECTED_EDGE_DENSITY: f64 = 0.25;

    pub const LOW_EDGE_SCORE: f64 = 0.2;

    pub const MIN_STAMP_WIDTH: i32 = 50;
    pub const MAX_STAMP_WIDTH: i32 = 500;
    pub const MIN_STAMP_HEIGHT: i32 = 50;
    pub const MAX_STAMP_HEIGHT: i32 = 500;

    pub const IDEAL_STAMP_WIDTH: f64 = 150.0;
    pub const IDEAL_STAMP_HEIGHT: f64 = 180.0;

    /// Largest relative deviation from the ideal size that still lowers the score
    pub const MAX_SIZE_DEVIATION: f64 = 0.7;

    pub const OUT_OF_RANGE_SIZE_SCORE: f64 = 0.3;

    pub const PERFORATION_EDGE_BAND: i32 = 5;
    pub const PERFORATION_VARIANCE_HIGH: f64 = 1000.0;
    pub const PERFORATION_VARIANCE_LOW: f64 = 200.0;

    pub const PERFORATION_STRONG_SCORE: f64 = 1.0;
    pub const PERFORATION_NEUTRAL_SCORE: f64 = 0.5;
    pub const PERFORATION_SMOOTH_SCORE: f64 = 0.3;

    /// Canny hysteresis thresholds shared by edge and perforation checks
    pub const CANNY_LOW_THRESHOLD: f64 = 50.0;
    pub const CANNY_HIGH_THRESHOLD: f64 = 150.0;
}

/// Stage 1C fallback detector defaults
pub mod fallback {
    pub const MODEL_PATH: &str = "models/yolov8n.onnx";

    pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

    /// Non-maximum suppression IoU threshold
    pub const NMS_THRESHOLD: f32 = 0.45;

    /// Square network input side
    pub const INPUT_SIZE: i32 = 640;

    /// COCO class count of the stock YOLOv8 export
    pub const NUM_CLASSES: i32 = 80;

    pub const MIN_AREA_RATIO: f64 = 0.01;
    pub const MAX_AREA_RATIO: f64 = 0.5;

    pub const ASPECT_RATIO_MIN: f64 = 0.3;
    pub const ASPECT_RATIO_MAX: f64 = 3.0;
}

/// Stage 2 similarity search defaults
pub mod search {
    /// Similarity at or above which a match is accepted without review
    pub const AUTO_THRESHOLD: f32 = 0.9;

    /// Similarity floor for any reported match
    pub const MIN_THRESHOLD: f32 = 0.5;

    pub const DEFAULT_TOP_K: usize = 3;
}

/// JPEG quality for crops sent to the describer
pub const CROP_JPEG_QUALITY: u8 = 90;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_weights_sum_to_one() {
        let sum = classifier::COLOR_VARIANCE_WEIGHT
            + classifier::EDGE_COMPLEXITY_WEIGHT
            + classifier::SIZE_WEIGHT
            + classifier::PERFORATION_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_ranges() {
        assert!(polygon::MIN_AREA_RATIO < polygon::MAX_AREA_RATIO);
        assert!(fallback::MIN_AREA_RATIO < fallback::MAX_AREA_RATIO);
        assert!(search::MIN_THRESHOLD < search::AUTO_THRESHOLD);
        assert!(classifier::PERFORATION_VARIANCE_LOW < classifier::PERFORATION_VARIANCE_HIGH);
    }

    #[test]
    fn test_opencv_kernel_sizes_are_odd() {
        assert_eq!(polygon::BLUR_KERNEL_SIZE % 2, 1);
        assert_eq!(polygon::THRESHOLD_BLOCK_SIZE % 2, 1);
    }
}
