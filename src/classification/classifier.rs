//! Stage 1B: stamp / not-stamp verdicts for candidate crops

use std::path::Path;

use opencv::{
    core::{Mat, Ptr},
    ml::{StatModel_Flags, SVM},
    prelude::*,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classification::heuristics;
use crate::config::{ClassifierConfig, ClassifierMode};
use crate::crop::ensure_bgr;
use crate::{Result, StampError};

/// The four stamp-likeness checks, in tie-breaking order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heuristic {
    ColorVariance,
    EdgeComplexity,
    SizePlausibility,
    PerforationHint,
}

impl Heuristic {
    pub const ALL: [Heuristic; 4] = [
        Heuristic::ColorVariance,
        Heuristic::EdgeComplexity,
        Heuristic::SizePlausibility,
        Heuristic::PerforationHint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Heuristic::ColorVariance => "color_variance",
            Heuristic::EdgeComplexity => "edge_complexity",
            Heuristic::SizePlausibility => "size_plausibility",
            Heuristic::PerforationHint => "perforation_hint",
        }
    }
}

/// Per-heuristic scores, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub color_variance: f64,
    pub edge_complexity: f64,
    pub size_plausibility: f64,
    pub perforation_hint: f64,
}

impl SubScores {
    pub fn get(&self, heuristic: Heuristic) -> f64 {
        match heuristic {
            Heuristic::ColorVariance => self.color_variance,
            Heuristic::EdgeComplexity => self.edge_complexity,
            Heuristic::SizePlausibility => self.size_plausibility,
            Heuristic::PerforationHint => self.perforation_hint,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Heuristic, f64)> + '_ {
        Heuristic::ALL.into_iter().map(move |h| (h, self.get(h)))
    }

    /// Weighted sum, clamped to [0, 1]
    pub fn weighted(&self, config: &ClassifierConfig) -> f64 {
        let confidence = self.color_variance * config.color_variance_weight
            + self.edge_complexity * config.edge_complexity_weight
            + self.size_plausibility * config.size_weight
            + self.perforation_hint * config.perforation_weight;
        confidence.clamp(0.0, 1.0)
    }

    /// Highest score; ties go to the earlier heuristic
    pub fn strongest(&self) -> Heuristic {
        self.iter()
            .fold(None, |best: Option<(Heuristic, f64)>, (h, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((h, score)),
            })
            .map_or(Heuristic::ColorVariance, |(h, _)| h)
    }

    /// Lowest score; ties go to the earlier heuristic
    pub fn weakest(&self) -> Heuristic {
        self.iter()
            .fold(None, |best: Option<(Heuristic, f64)>, (h, score)| match best {
                Some((_, best_score)) if best_score <= score => best,
                _ => Some((h, score)),
            })
            .map_or(Heuristic::ColorVariance, |(h, _)| h)
    }

    fn as_features(&self) -> [f32; 4] {
        [
            self.color_variance as f32,
            self.edge_complexity as f32,
            self.size_plausibility as f32,
            self.perforation_hint as f32,
        ]
    }
}

/// Classification verdict for one crop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_stamp: bool,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Strongest check when accepted, weakest when rejected
    pub reason: Heuristic,
    pub scores: SubScores,
    /// Strategy that produced the confidence
    pub mode: ClassifierMode,
}

impl Verdict {
    fn new(confidence: f64, scores: SubScores, mode: ClassifierMode, threshold: f64) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        let is_stamp = confidence >= threshold;
        let reason = if is_stamp {
            scores.strongest()
        } else {
            scores.weakest()
        };
        Self {
            is_stamp,
            confidence,
            reason,
            scores,
            mode,
        }
    }
}

/// Trained SVM over the four heuristic scores
///
/// Label 1 means stamp. The distance to the margin is squashed into a
/// probability-like confidence.
struct SvmModel {
    svm: Mutex<Ptr<SVM>>,
}

impl SvmModel {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StampError::ModelLoad {
                message: format!("classifier model not found at {}", path.display()),
                source: None,
            });
        }
        let path_str = path.to_str().ok_or_else(|| StampError::ModelLoad {
            message: format!("model path is not valid UTF-8: {}", path.display()),
            source: None,
        })?;
        let svm = SVM::load(path_str)
            .map_err(|e| StampError::model_load("failed to load classifier model", e))?;
        Ok(Self {
            svm: Mutex::new(svm),
        })
    }

    fn confidence(&self, scores: &SubScores) -> Result<f64> {
        let features = scores.as_features();
        let samples = Mat::from_slice(&features)
            .and_then(|m| m.reshape(1, 1).and_then(|r| r.try_clone()))
            .map_err(|e| StampError::opencv("feature vector", e))?;

        let svm = self.svm.lock();
        let mut output = Mat::default();
        let label = svm
            .predict(&samples, &mut output, 0)
            .map_err(|e| StampError::opencv("SVM prediction", e))?;
        let margin = svm
            .predict(&samples, &mut output, StatModel_Flags::RAW_OUTPUT as i32)
            .map_err(|e| StampError::opencv("SVM decision value", e))?;

        let certainty = sigmoid(margin.abs() as f64);
        Ok(if label.round() as i32 == 1 {
            certainty
        } else {
            1.0 - certainty
        })
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Stamp classifier combining weighted heuristics with an optional SVM
pub struct StampClassifier {
    config: ClassifierConfig,
    model: Option<SvmModel>,
}

impl std::fmt::Debug for StampClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampClassifier")
            .field("config", &self.config)
            .field("model_loaded", &self.model.is_some())
            .finish()
    }
}

impl Default for StampClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl StampClassifier {
    /// Create a classifier, loading the SVM for `model` and `both` modes
    ///
    /// A missing or unreadable model degrades to heuristic mode.
    pub fn new(mut config: ClassifierConfig) -> Self {
        let model = match config.mode {
            ClassifierMode::Heuristic => None,
            ClassifierMode::Model | ClassifierMode::Both => {
                let loaded = match &config.model_path {
                    Some(path) => SvmModel::load(path),
                    None => Err(StampError::ModelLoad {
                        message: "no classifier model path configured".into(),
                        source: None,
                    }),
                };
                match loaded {
                    Ok(model) => Some(model),
                    Err(e) => {
                        warn!(error = %e, "classifier model unavailable, using heuristics only");
                        config.mode = ClassifierMode::Heuristic;
                        None
                    }
                }
            }
        };

        debug!(mode = ?config.mode, "stamp classifier initialized");
        Self { config, model }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Effective mode after model loading
    pub fn mode(&self) -> ClassifierMode {
        self.config.mode
    }

    /// Classify a crop as stamp or not
    ///
    /// # Errors
    ///
    /// `StampError::DegenerateCrop` for an empty crop, `StampError::OpenCv`
    /// if an image operation fails.
    pub fn classify(&self, crop: &Mat) -> Result<Verdict> {
        if crop.empty() || crop.rows() == 0 || crop.cols() == 0 {
            return Err(StampError::DegenerateCrop {
                width: crop.cols(),
                height: crop.rows(),
            });
        }
        let crop = ensure_bgr(crop)?;

        let scores = self.score(&crop)?;
        let heuristic_confidence = scores.weighted(&self.config);

        let confidence = match (&self.model, self.config.mode) {
            (Some(model), ClassifierMode::Model) => model.confidence(&scores)?,
            (Some(model), ClassifierMode::Both) => {
                (heuristic_confidence + model.confidence(&scores)?) / 2.0
            }
            _ => heuristic_confidence,
        };

        Ok(Verdict::new(
            confidence,
            scores,
            self.config.mode,
            self.config.confidence_threshold,
        ))
    }

    /// Compute all four heuristic scores
    pub fn score(&self, crop: &Mat) -> Result<SubScores> {
        let edges = heuristics::edge_map(crop)?;
        Ok(SubScores {
            color_variance: heuristics::color_variance_score(crop, &self.config)?,
            edge_complexity: heuristics::edge_complexity_score(&edges, &self.config)?,
            size_plausibility: heuristics::size_score(crop.cols(), crop.rows(), &self.config),
            perforation_hint: heuristics::perforation_score(&edges, &self.config)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    fn scores(c: f64, e: f64, s: f64, p: f64) -> SubScores {
        SubScores {
            color_variance: c,
            edge_complexity: e,
            size_plausibility: s,
            perforation_hint: p,
        }
    }

    #[test]
    fn test_weighted_confidence() {
        let config = ClassifierConfig::default();
        let all_ones = scores(1.0, 1.0, 1.0, 1.0);
        assert!((all_ones.weighted(&config) - 1.0).abs() < 1e-9);

        let mixed = scores(1.0, 0.0, 0.0, 0.0);
        assert!((mixed.weighted(&config) - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_confidence_is_clamped() {
        let config = ClassifierConfig {
            color_variance_weight: 2.0,
            ..ClassifierConfig::default()
        };
        assert_eq!(scores(1.0, 1.0, 1.0, 1.0).weighted(&config), 1.0);
    }

    #[test]
    fn test_reason_ties_resolve_in_order() {
        let tied = scores(0.5, 0.5, 0.5, 0.5);
        assert_eq!(tied.strongest(), Heuristic::ColorVariance);
        assert_eq!(tied.weakest(), Heuristic::ColorVariance);

        let s = scores(0.2, 0.9, 0.9, 0.2);
        assert_eq!(s.strongest(), Heuristic::EdgeComplexity);
        assert_eq!(s.weakest(), Heuristic::ColorVariance);
    }

    #[test]
    fn test_verdict_reason_follows_outcome() {
        let s = scores(0.9, 0.8, 0.7, 0.1);

        let accepted = Verdict::new(0.7, s, ClassifierMode::Heuristic, 0.6);
        assert!(accepted.is_stamp);
        assert_eq!(accepted.reason, Heuristic::ColorVariance);

        let rejected = Verdict::new(0.5, s, ClassifierMode::Heuristic, 0.6);
        assert!(!rejected.is_stamp);
        assert_eq!(rejected.reason, Heuristic::PerforationHint);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let verdict =
            Verdict::new(0.6, scores(1.0, 1.0, 1.0, 1.0), ClassifierMode::Heuristic, 0.6);
        assert!(verdict.is_stamp);
    }

    #[test]
    fn test_empty_crop_is_degenerate() {
        let classifier = StampClassifier::default();
        let result = classifier.classify(&Mat::default());
        assert!(matches!(result, Err(StampError::DegenerateCrop { .. })));
    }

    #[test]
    fn test_white_crop_rejected() {
        let classifier = StampClassifier::default();
        let white = Mat::new_rows_cols_with_default(180, 150, CV_8UC3, Scalar::all(255.0)).unwrap();

        let verdict = classifier.classify(&white).unwrap();
        assert!(verdict.scores.color_variance < 0.5);
        assert!(verdict.scores.edge_complexity < 0.5);
        assert!(!verdict.is_stamp);
        assert_eq!(verdict.is_stamp, verdict.confidence >= 0.6);
    }

    #[test]
    fn test_missing_model_degrades_to_heuristics() {
        let classifier = StampClassifier::new(ClassifierConfig {
            mode: ClassifierMode::Both,
            model_path: Some("/nonexistent/stamp_svm.xml".into()),
            ..ClassifierConfig::default()
        });
        assert_eq!(classifier.mode(), ClassifierMode::Heuristic);

        let crop = Mat::new_rows_cols_with_default(100, 100, CV_8UC3, Scalar::all(200.0)).unwrap();
        let verdict = classifier.classify(&crop).unwrap();
        assert_eq!(verdict.mode, ClassifierMode::Heuristic);
    }

    #[test]
    fn test_grayscale_crop_is_accepted_as_input() {
        let classifier = StampClassifier::default();
        let gray =
            Mat::new_rows_cols_with_default(100, 100, opencv::core::CV_8UC1, Scalar::all(40.0))
                .unwrap();
        let verdict = classifier.classify(&gray).unwrap();
        assert!((0.0..=1.0).contains(&verdict.confidence));
    }

    /// Train a linear SVM on separable sub-score rows and save it under the temp dir
    fn trained_model_path(name: &str) -> std::path::PathBuf {
        use opencv::core::{CV_32F, CV_32S};
        use opencv::ml::{SVM_KernelTypes, SVM_Types, ROW_SAMPLE};

        let rows: [([f32; 4], i32); 8] = [
            ([0.9, 0.8, 0.9, 0.7], 1),
            ([0.8, 0.9, 1.0, 1.0], 1),
            ([1.0, 0.7, 0.8, 0.5], 1),
            ([0.7, 0.8, 0.9, 1.0], 1),
            ([0.1, 0.2, 0.3, 0.3], 0),
            ([0.1, 0.3, 0.5, 0.5], 0),
            ([0.2, 0.2, 0.3, 0.3], 0),
            ([0.3, 0.1, 0.4, 0.5], 0),
        ];
        let mut features = Mat::zeros(rows.len() as i32, 4, CV_32F).unwrap().to_mat().unwrap();
        let mut labels = Mat::zeros(rows.len() as i32, 1, CV_32S).unwrap().to_mat().unwrap();
        for (i, (row, label)) in rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                *features.at_2d_mut::<f32>(i as i32, j as i32).unwrap() = *value;
            }
            *labels.at_2d_mut::<i32>(i as i32, 0).unwrap() = *label;
        }

        let mut svm = SVM::create().unwrap();
        svm.set_type(SVM_Types::C_SVC as i32).unwrap();
        svm.set_kernel(SVM_KernelTypes::LINEAR as i32).unwrap();
        svm.set_c(1.0).unwrap();
        svm.train(&features, ROW_SAMPLE, &labels).unwrap();

        let dir = std::env::temp_dir().join(format!("stampscan-svm-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        svm.save(path.to_str().unwrap()).unwrap();
        path
    }

    fn classifier_with(mode: ClassifierMode, model_path: &Path) -> StampClassifier {
        StampClassifier::new(ClassifierConfig {
            mode,
            model_path: Some(model_path.to_path_buf()),
            ..ClassifierConfig::default()
        })
    }

    #[test]
    fn test_trained_model_modes() {
        let path = trained_model_path("stamp_svm_modes.xml");
        let crop =
            Mat::new_rows_cols_with_default(180, 150, CV_8UC3, Scalar::new(40.0, 90.0, 200.0, 0.0))
                .unwrap();

        let heuristic = classifier_with(ClassifierMode::Heuristic, &path);
        let model = classifier_with(ClassifierMode::Model, &path);
        let both = classifier_with(ClassifierMode::Both, &path);
        assert_eq!(model.mode(), ClassifierMode::Model);
        assert_eq!(both.mode(), ClassifierMode::Both);

        let h = heuristic.classify(&crop).unwrap();
        let m = model.classify(&crop).unwrap();
        let b = both.classify(&crop).unwrap();

        assert_eq!(m.mode, ClassifierMode::Model);
        assert_eq!(b.mode, ClassifierMode::Both);
        for verdict in [&h, &m, &b] {
            assert!((0.0..=1.0).contains(&verdict.confidence));
            assert_eq!(verdict.is_stamp, verdict.confidence >= 0.6);
        }
        assert!((b.confidence - (h.confidence + m.confidence) / 2.0).abs() < 1e-12);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_trained_model_separates_scores() {
        let path = trained_model_path("stamp_svm_separation.xml");
        let model = SvmModel::load(&path).unwrap();

        let stamp_like = model.confidence(&scores(0.9, 0.85, 0.9, 0.8)).unwrap();
        let blank_like = model.confidence(&scores(0.1, 0.2, 0.3, 0.3)).unwrap();
        assert!(stamp_like > 0.5);
        assert!(blank_like < 0.5);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(4.0) > 0.95);
    }
}
