//! Debug overlays for detection results

use std::borrow::Cow;

use opencv::{
    core::{Mat, Point, Scalar, Vector},
    imgproc::{polylines, put_text, rectangle, FONT_HERSHEY_SIMPLEX, LINE_8},
    prelude::*,
};

use crate::crop::ensure_bgr;
use crate::detection::types::{DetectedStamp, DetectionOutcome, DetectionSource};
use crate::{Result, StampError};

const ACCEPTED_COLOR: (f64, f64, f64) = (0.0, 255.0, 0.0);
const FALLBACK_COLOR: (f64, f64, f64) = (255.0, 0.0, 255.0);
const REJECTED_COLOR: (f64, f64, f64) = (0.0, 0.0, 255.0);

fn bgr((b, g, r): (f64, f64, f64)) -> Scalar {
    Scalar::new(b, g, r, 0.0)
}

/// Draw accepted and rejected detections on a copy of `image`
///
/// Rejected candidates are outlined in red with their reason. Accepted
/// geometric stamps are drawn in green along their polygon, fallback
/// stamps in magenta along their box, labelled with confidence.
pub fn annotate(image: &Mat, outcome: &DetectionOutcome) -> Result<Mat> {
    let mut output = match ensure_bgr(image)? {
        Cow::Borrowed(bgr) => bgr
            .try_clone()
            .map_err(|e| StampError::opencv("image copy", e))?,
        Cow::Owned(bgr) => bgr,
    };

    for stamp in &outcome.rejected {
        let label = format!("X {}", stamp.verdict.reason.as_str());
        draw_box(&mut output, stamp, bgr(REJECTED_COLOR), 2)?;
        draw_label(&mut output, stamp, &label, bgr(REJECTED_COLOR), 0.4)?;
    }

    for stamp in &outcome.accepted {
        let color = match stamp.source {
            DetectionSource::Geometric => bgr(ACCEPTED_COLOR),
            DetectionSource::Fallback => bgr(FALLBACK_COLOR),
        };
        match &stamp.vertices {
            Some(vertices) => {
                let mut polygon = Vector::<Vector<Point>>::new();
                polygon.push(Vector::from_slice(vertices));
                polylines(&mut output, &polygon, true, color, 2, LINE_8, 0)
                    .map_err(|e| StampError::opencv("polygon overlay", e))?;
            }
            None => draw_box(&mut output, stamp, color, 2)?,
        }
        let label = format!("{:.0}%", stamp.verdict.confidence * 100.0);
        draw_label(&mut output, stamp, &label, color, 0.5)?;
    }

    Ok(output)
}

fn draw_box(image: &mut Mat, stamp: &DetectedStamp, color: Scalar, thickness: i32) -> Result<()> {
    rectangle(image, stamp.bbox.to_rect(), color, thickness, LINE_8, 0)
        .map_err(|e| StampError::opencv("box overlay", e))
}

fn draw_label(
    image: &mut Mat,
    stamp: &DetectedStamp,
    text: &str,
    color: Scalar,
    scale: f64,
) -> Result<()> {
    let origin = Point::new(stamp.bbox.x, (stamp.bbox.y - 5).max(10));
    put_text(image, text, origin, FONT_HERSHEY_SIMPLEX, scale, color, 1, LINE_8, false)
        .map_err(|e| StampError::opencv("label overlay", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::{Heuristic, SubScores, Verdict};
    use crate::config::ClassifierMode;
    use crate::detection::types::{BoundingBox, ShapeKind};
    use opencv::core::{Vec3b, CV_8UC3};

    fn stamp(source: DetectionSource, vertices: Option<Vec<Point>>) -> DetectedStamp {
        let scores = SubScores {
            color_variance: 0.8,
            edge_complexity: 0.8,
            size_plausibility: 0.8,
            perforation_hint: 0.5,
        };
        DetectedStamp {
            id: source.detection_id(1),
            shape: ShapeKind::Quadrilateral,
            bbox: BoundingBox::new(20, 20, 60, 60),
            vertices,
            crop: Mat::default(),
            verdict: Verdict {
                is_stamp: true,
                confidence: 0.75,
                reason: Heuristic::ColorVariance,
                scores,
                mode: ClassifierMode::Heuristic,
            },
            source,
            detector_confidence: 1.0,
        }
    }

    #[test]
    fn test_annotate_leaves_input_untouched() {
        let image = Mat::new_rows_cols_with_default(120, 120, CV_8UC3, Scalar::all(255.0)).unwrap();
        let outcome = DetectionOutcome {
            accepted: vec![stamp(DetectionSource::Fallback, None)],
            rejected: Vec::new(),
        };

        let annotated = annotate(&image, &outcome).unwrap();
        assert_eq!(annotated.size().unwrap(), image.size().unwrap());

        let drawn: &Vec3b = annotated.at_2d(20, 40).unwrap();
        assert_eq!((drawn[0], drawn[1], drawn[2]), (255, 0, 255));

        let original: &Vec3b = image.at_2d(20, 40).unwrap();
        assert_eq!((original[0], original[1], original[2]), (255, 255, 255));
    }

    #[test]
    fn test_annotate_draws_polygons() {
        let image = Mat::new_rows_cols_with_default(120, 120, CV_8UC3, Scalar::all(255.0)).unwrap();
        let vertices = vec![
            Point::new(20, 20),
            Point::new(80, 20),
            Point::new(80, 80),
            Point::new(20, 80),
        ];
        let outcome = DetectionOutcome {
            accepted: vec![stamp(DetectionSource::Geometric, Some(vertices))],
            rejected: Vec::new(),
        };

        let annotated = annotate(&image, &outcome).unwrap();
        let drawn: &Vec3b = annotated.at_2d(50, 80).unwrap();
        assert_eq!((drawn[0], drawn[1], drawn[2]), (0, 255, 0));
    }
}
