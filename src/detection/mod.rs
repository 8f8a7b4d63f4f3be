//! Stamp detection module
//!
//! This module locates stamp candidates in album page images: geometric
//! polygon extraction, ML fallback detection, and the pipeline that runs
//! both through the stamp classifier.

pub mod fallback;
pub mod pipeline;
pub mod polygon;
pub mod types;
pub mod visualize;

pub use fallback::{
    BoxDetector, DetectorFactory, DirectoryProvisioner, FallbackDetector, ModelProvisioner,
    OnnxDetectorFactory, ScoredBox,
};
pub use pipeline::DetectionPipeline;
pub use polygon::PolygonDetector;
pub use types::{
    BoundingBox, CandidatePolygon, DetectedBox, DetectedStamp, DetectionOutcome, DetectionRecord,
    DetectionSource, RawCandidate, ShapeKind,
};
