//! Candidate and detection records shared by the detection stages

use opencv::core::{Mat, Point, Rect};
use serde::{Deserialize, Serialize};

use crate::classification::Verdict;

/// Axis-aligned bounding box in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    /// Width over height, 0.0 for a zero-height box
    pub fn aspect_ratio(&self) -> f64 {
        if self.height > 0 {
            self.width as f64 / self.height as f64
        } else {
            0.0
        }
    }

    /// Clip to an image of the given size
    pub fn clamp_to(&self, image_width: i32, image_height: i32) -> Self {
        let x = self.x.clamp(0, image_width);
        let y = self.y.clamp(0, image_height);
        let right = (self.x + self.width).clamp(x, image_width);
        let bottom = (self.y + self.height).clamp(y, image_height);
        Self::new(x, y, right - x, bottom - y)
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

impl From<Rect> for BoundingBox {
    fn from(rect: Rect) -> Self {
        Self::new(rect.x, rect.y, rect.width, rect.height)
    }
}

/// Polygon shape of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Triangle,
    Quadrilateral,
}

impl ShapeKind {
    /// Shape for an approximated polygon with `vertices` corners
    pub fn from_vertex_count(vertices: usize) -> Self {
        if vertices == 3 {
            ShapeKind::Triangle
        } else {
            ShapeKind::Quadrilateral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Triangle => "triangle",
            ShapeKind::Quadrilateral => "quadrilateral",
        }
    }
}

/// Stage that produced a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Geometric,
    Fallback,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionSource::Geometric => "geometric",
            DetectionSource::Fallback => "fallback",
        }
    }

    /// Detection id for the `index`-th (1-based) output of this source
    pub fn detection_id(&self, index: usize) -> String {
        format!("{}-{}", self.as_str(), index)
    }
}

/// Stage 1A output: a stamp-shaped polygon with its rectified crop
#[derive(Debug, Clone)]
pub struct CandidatePolygon {
    /// Approximated polygon corners (3 or 4)
    pub vertices: Vec<Point>,
    pub bbox: BoundingBox,
    pub shape: ShapeKind,
    /// Contour area in pixels
    pub area: f64,
    /// Bounding box width over height
    pub aspect_ratio: f64,
    /// Perspective-corrected (quadrilateral) or masked (triangle) crop
    pub crop: Mat,
}

/// Stage 1C output: an axis-aligned box from the object detector
#[derive(Debug, Clone)]
pub struct DetectedBox {
    pub bbox: BoundingBox,
    /// Raw detector score
    pub confidence: f32,
    /// Class index reported by the detector
    pub class_id: i32,
    pub crop: Mat,
}

/// Either kind of candidate, as consumed by the classification step
#[derive(Debug, Clone)]
pub enum RawCandidate {
    Polygon(CandidatePolygon),
    Box(DetectedBox),
}

impl RawCandidate {
    pub fn source(&self) -> DetectionSource {
        match self {
            RawCandidate::Polygon(_) => DetectionSource::Geometric,
            RawCandidate::Box(_) => DetectionSource::Fallback,
        }
    }

    /// Fallback boxes are always reported as quadrilaterals
    pub fn shape(&self) -> ShapeKind {
        match self {
            RawCandidate::Polygon(polygon) => polygon.shape,
            RawCandidate::Box(_) => ShapeKind::Quadrilateral,
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        match self {
            RawCandidate::Polygon(polygon) => polygon.bbox,
            RawCandidate::Box(detected) => detected.bbox,
        }
    }

    pub fn crop(&self) -> &Mat {
        match self {
            RawCandidate::Polygon(polygon) => &polygon.crop,
            RawCandidate::Box(detected) => &detected.crop,
        }
    }

    /// Geometric candidates carry no detector score and report 1.0
    pub fn detector_confidence(&self) -> f32 {
        match self {
            RawCandidate::Polygon(_) => 1.0,
            RawCandidate::Box(detected) => detected.confidence,
        }
    }

    /// Combine with its verdict into the pipeline's output record
    pub fn into_detected(self, id: String, verdict: Verdict) -> DetectedStamp {
        let source = self.source();
        let detector_confidence = self.detector_confidence();
        match self {
            RawCandidate::Polygon(polygon) => DetectedStamp {
                id,
                shape: polygon.shape,
                bbox: polygon.bbox,
                vertices: Some(polygon.vertices),
                crop: polygon.crop,
                verdict,
                source,
                detector_confidence,
            },
            RawCandidate::Box(detected) => DetectedStamp {
                id,
                shape: ShapeKind::Quadrilateral,
                bbox: detected.bbox,
                vertices: None,
                crop: detected.crop,
                verdict,
                source,
                detector_confidence,
            },
        }
    }
}

impl From<CandidatePolygon> for RawCandidate {
    fn from(polygon: CandidatePolygon) -> Self {
        RawCandidate::Polygon(polygon)
    }
}

impl From<DetectedBox> for RawCandidate {
    fn from(detected: DetectedBox) -> Self {
        RawCandidate::Box(detected)
    }
}

/// Final pipeline record for one candidate
#[derive(Debug, Clone)]
pub struct DetectedStamp {
    /// `geometric-N` or `fallback-N`
    pub id: String,
    pub shape: ShapeKind,
    pub bbox: BoundingBox,
    /// Polygon corners, absent for fallback detections
    pub vertices: Option<Vec<Point>>,
    pub crop: Mat,
    pub verdict: Verdict,
    pub source: DetectionSource,
    pub detector_confidence: f32,
}

impl DetectedStamp {
    /// Serializable view without pixel data
    pub fn record(&self) -> DetectionRecord {
        DetectionRecord {
            id: self.id.clone(),
            shape: self.shape,
            bbox: self.bbox,
            vertices: self
                .vertices
                .as_ref()
                .map(|points| points.iter().map(|p| [p.x, p.y]).collect()),
            verdict: self.verdict.clone(),
            source: self.source,
            detector_confidence: self.detector_confidence,
        }
    }
}

/// Pixel-free detection record for logs, feedback and reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: String,
    pub shape: ShapeKind,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertices: Option<Vec<[i32; 2]>>,
    pub verdict: Verdict,
    pub source: DetectionSource,
    pub detector_confidence: f32,
}

/// Pipeline result: accepted stamps and reported rejects
#[derive(Debug, Clone, Default)]
pub struct DetectionOutcome {
    pub accepted: Vec<DetectedStamp>,
    /// Geometric candidates the classifier turned down
    pub rejected: Vec<DetectedStamp>,
}

impl DetectionOutcome {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }

    /// True when any accepted stamp came from the fallback detector
    pub fn used_fallback(&self) -> bool {
        self.accepted
            .iter()
            .any(|stamp| stamp.source == DetectionSource::Fallback)
    }

    pub fn records(&self) -> (Vec<DetectionRecord>, Vec<DetectionRecord>) {
        (
            self.accepted.iter().map(DetectedStamp::record).collect(),
            self.rejected.iter().map(DetectedStamp::record).collect(),
        )
    }
}
