//! # Stamp Scan
//!
//! A Rust crate for finding postage stamps in album page photographs and
//! matching them against a reference catalog.
//!
//! This library provides:
//! - Detecting stamp-shaped polygons and rectifying their crops
//! - Scoring each crop as stamp or not-stamp, with an ML box detector as
//!   fallback when nothing geometric survives
//! - Identifying accepted stamps by similarity search over catalog
//!   embeddings, tiered by confidence
//!
//! ## Example
//!
//! ```rust,no_run
//! use stampscan::{detect_file, PipelineConfig};
//! use std::path::Path;
//!
//! let outcome = detect_file(Path::new("album_page.jpg"), PipelineConfig::default())?;
//! for stamp in &outcome.accepted {
//!     println!("{} at {:?}: {:.0}%", stamp.id, stamp.bbox, stamp.verdict.confidence * 100.0);
//! }
//! # Ok::<(), stampscan::StampError>(())
//! ```

use std::path::Path;

pub mod classification;
pub mod config;
pub mod constants;
pub mod crop;
pub mod detection;
pub mod error;
pub mod search;

pub use classification::{Heuristic, StampClassifier, SubScores, Verdict};
pub use config::{
    ClassifierConfig, ClassifierMode, FallbackConfig, PipelineConfig, PolygonConfig, SearchConfig,
};
pub use detection::{
    BoundingBox, DetectedStamp, DetectionOutcome, DetectionPipeline, DetectionRecord,
    DetectionSource, FallbackDetector, PolygonDetector, ShapeKind,
};
pub use error::{Result, StampError};
pub use search::{
    Describer, Embedder, IdentificationResult, MatchTier, ReferenceEntry, SearchResult, Searcher,
    VectorStore,
};

/// Detect stamps in an image file
///
/// Convenience wrapper that loads the image and runs a fresh
/// [`DetectionPipeline`] built from `config`.
///
/// # Errors
///
/// Returns `StampError` if:
/// - The configuration is invalid
/// - The image cannot be read or decoded
/// - The decoded image is empty
pub fn detect_file(image_path: &Path, config: PipelineConfig) -> Result<DetectionOutcome> {
    config.validate()?;
    let image = crop::load_image(image_path)?;
    DetectionPipeline::new(config).detect_stamps(&image)
}
