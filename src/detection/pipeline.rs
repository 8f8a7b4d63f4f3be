//! Detection pipeline orchestrating Stages 1A, 1B and 1C
//!
//! Geometric candidates are classified and reported as accepted or
//! rejected. Only when no geometric candidate is accepted does the fallback
//! detector run; its boxes go through the same classifier and rejected
//! fallback boxes are discarded.

use std::sync::Arc;

use opencv::{core::Mat, prelude::*};
use tracing::{debug, info, warn};

use crate::classification::StampClassifier;
use crate::config::PipelineConfig;
use crate::crop::ensure_bgr;
use crate::detection::fallback::{DetectorFactory, FallbackDetector};
use crate::detection::polygon::PolygonDetector;
use crate::detection::types::{DetectedStamp, DetectionOutcome, RawCandidate};
use crate::Result;

/// End-to-end stamp detector for a single image
#[derive(Debug)]
pub struct DetectionPipeline {
    polygon: PolygonDetector,
    classifier: StampClassifier,
    fallback: Option<FallbackDetector>,
}

impl Default for DetectionPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl DetectionPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let fallback = config
            .enable_fallback
            .then(|| FallbackDetector::new(config.fallback.clone()));
        Self::from_parts(config, fallback)
    }

    /// Create a pipeline whose fallback model comes from `factory`
    pub fn with_fallback_factory(
        config: PipelineConfig,
        factory: Arc<dyn DetectorFactory>,
    ) -> Self {
        let fallback = config
            .enable_fallback
            .then(|| FallbackDetector::with_factory(config.fallback.clone(), factory));
        Self::from_parts(config, fallback)
    }

    fn from_parts(config: PipelineConfig, fallback: Option<FallbackDetector>) -> Self {
        Self {
            polygon: PolygonDetector::new(config.polygon),
            classifier: StampClassifier::new(config.classifier),
            fallback,
        }
    }

    pub fn classifier(&self) -> &StampClassifier {
        &self.classifier
    }

    pub fn fallback(&self) -> Option<&FallbackDetector> {
        self.fallback.as_ref()
    }

    /// Detect stamps in an image
    ///
    /// Grayscale and BGRA images are converted to BGR first.
    ///
    /// # Errors
    ///
    /// Returns `StampError::InvalidImage` for an empty image or an
    /// unsupported pixel layout. Failures on individual candidates are
    /// logged and the candidate is dropped.
    pub fn detect_stamps(&self, image: &Mat) -> Result<DetectionOutcome> {
        self.detect_stamps_with(image, true)
    }

    /// Detect stamps, choosing per call whether Stage 1C may run
    ///
    /// `use_fallback = false` skips the fallback detector for this image
    /// without loading its model. `true` runs it only if the pipeline was
    /// built with fallback enabled.
    pub fn detect_stamps_with(&self, image: &Mat, use_fallback: bool) -> Result<DetectionOutcome> {
        let image = ensure_bgr(image)?;
        info!(
            width = image.cols(),
            height = image.rows(),
            use_fallback,
            "starting detection"
        );

        let mut outcome = DetectionOutcome::default();

        // Stage 1A + 1B
        let polygons = self.polygon.detect(&image)?;
        debug!(candidates = polygons.len(), "stage 1A complete");

        let mut index = 0;
        for polygon in polygons {
            let Some(stamp) = self.classify(RawCandidate::Polygon(polygon), index + 1) else {
                continue;
            };
            index += 1;
            if stamp.verdict.is_stamp {
                outcome.accepted.push(stamp);
            } else {
                outcome.rejected.push(stamp);
            }
        }
        info!(
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            "stage 1B complete"
        );

        // Stage 1C, only when nothing geometric was accepted
        if outcome.accepted.is_empty() {
            if let Some(fallback) = self.fallback.as_ref().filter(|_| use_fallback) {
                let accepted = self.run_fallback(fallback, &image);
                info!(accepted = accepted.len(), "stage 1C complete");
                outcome.accepted.extend(accepted);
            }
        }

        Ok(outcome)
    }

    fn run_fallback(&self, fallback: &FallbackDetector, image: &Mat) -> Vec<DetectedStamp> {
        let mut accepted = Vec::new();
        for detected in fallback.detect(image) {
            let candidate = RawCandidate::Box(detected);
            if let Some(stamp) = self.classify(candidate, accepted.len() + 1) {
                if stamp.verdict.is_stamp {
                    accepted.push(stamp);
                } else {
                    debug!(reason = stamp.verdict.reason.as_str(), "discarding fallback box");
                }
            }
        }
        accepted
    }

    /// Classify a candidate into an output record numbered `index` within its source
    fn classify(&self, candidate: RawCandidate, index: usize) -> Option<DetectedStamp> {
        let source = candidate.source();
        match self.classifier.classify(candidate.crop()) {
            Ok(verdict) => {
                let id = source.detection_id(index);
                debug!(
                    id = %id,
                    is_stamp = verdict.is_stamp,
                    confidence = verdict.confidence,
                    reason = verdict.reason.as_str(),
                    "classified candidate"
                );
                Some(candidate.into_detected(id, verdict))
            }
            Err(e) => {
                warn!(
                    source = source.as_str(),
                    bbox = ?candidate.bbox(),
                    error = %e,
                    "dropping candidate"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackConfig;
    use crate::detection::fallback::{BoxDetector, ScoredBox};
    use crate::detection::types::BoundingBox;
    use crate::StampError;
    use opencv::core::{Scalar, CV_8UC3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        loads: AtomicUsize,
    }

    struct OneBox;

    impl BoxDetector for OneBox {
        fn detect(&self, _image: &Mat) -> Result<Vec<ScoredBox>> {
            Ok(vec![ScoredBox {
                bbox: BoundingBox::new(50, 50, 100, 120),
                confidence: 0.9,
                class_id: 0,
            }])
        }
    }

    impl DetectorFactory for CountingFactory {
        fn create(&self, _config: &FallbackConfig) -> Result<Box<dyn BoxDetector>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OneBox))
        }
    }

    fn blank(size: i32) -> Mat {
        Mat::new_rows_cols_with_default(size, size, CV_8UC3, Scalar::all(255.0)).unwrap()
    }

    #[test]
    fn test_blank_image_without_fallback() {
        let pipeline = DetectionPipeline::new(PipelineConfig {
            enable_fallback: false,
            ..PipelineConfig::default()
        });
        let outcome = pipeline.detect_stamps(&blank(300)).unwrap();
        assert!(outcome.is_empty());
        assert!(pipeline.fallback().is_none());
    }

    #[test]
    fn test_empty_image_is_error() {
        let pipeline = DetectionPipeline::default();
        assert!(matches!(
            pipeline.detect_stamps(&Mat::default()),
            Err(StampError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_fallback_skipped_per_call() {
        let factory = Arc::new(CountingFactory {
            loads: AtomicUsize::new(0),
        });
        let pipeline =
            DetectionPipeline::with_fallback_factory(PipelineConfig::default(), factory.clone());
        assert!(pipeline.fallback().is_some());

        let outcome = pipeline.detect_stamps_with(&blank(400), false).unwrap();
        assert!(outcome.is_empty());
        assert_eq!(factory.loads.load(Ordering::SeqCst), 0);

        pipeline.detect_stamps_with(&blank(400), true).unwrap();
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
    }
}
