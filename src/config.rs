//! Configuration structures for the stamp detection and identification pipeline.
//!
//! Every stage takes its own small configuration record by value, so tests
//! can build pipelines with extreme parameters without touching global state.
//!
//! # Configuration Loading
//!
//! ```no_run
//! use stampscan::PipelineConfig;
//! use std::path::Path;
//!
//! // Load from file
//! let config = PipelineConfig::from_json_file(Path::new("pipeline.json"))?;
//!
//! // Or use defaults
//! let config = PipelineConfig::default();
//! # Ok::<(), stampscan::StampError>(())
//! ```
//!
//! # Configuration Sections
//!
//! - [`PolygonConfig`]: Stage 1A preprocessing and contour filters
//! - [`ClassifierConfig`]: Stage 1B heuristic weights and thresholds
//! - [`FallbackConfig`]: Stage 1C model location and box filters
//! - [`SearchConfig`]: Stage 2 match thresholds

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{classifier, fallback, polygon, search};
use crate::{Result, StampError};

/// Detection pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stage 1A polygon detection
    pub polygon: PolygonConfig,

    /// Stage 1B stamp classification
    pub classifier: ClassifierConfig,

    /// Stage 1C fallback detection
    pub fallback: FallbackConfig,

    /// Run Stage 1C when Stage 1A yields no accepted stamps
    pub enable_fallback: bool,
}

/// Stage 1A polygon detection parameters.
///
/// Area ratios are relative to the full image area. Kernel and block
/// sizes must be odd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolygonConfig {
    pub min_vertices: usize,
    pub max_vertices: usize,

    pub min_area_ratio: f64,
    pub max_area_ratio: f64,

    pub aspect_ratio_min: f64,
    pub aspect_ratio_max: f64,

    /// Polygon approximation epsilon as fraction of perimeter
    pub approx_epsilon: f64,

    /// Gaussian blur kernel size
    pub blur_kernel_size: i32,

    /// Adaptive threshold block size
    pub threshold_block_size: i32,

    /// Adaptive threshold constant
    pub threshold_c: f64,

    /// Reject non-convex approximations
    pub require_convex: bool,
}

/// Classification strategy for Stage 1B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierMode {
    /// Weighted heuristics only
    #[default]
    Heuristic,
    /// Trained model only
    Model,
    /// Average of heuristic and model confidence
    Both,
}

/// Stage 1B classifier parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub mode: ClassifierMode,

    /// Minimum confidence for a stamp verdict
    pub confidence_threshold: f64,

    pub color_variance_weight: f64,
    pub edge_complexity_weight: f64,
    pub size_weight: f64,
    pub perforation_weight: f64,

    /// Summed Lab variance below which the crop is considered blank
    pub min_color_variance: f64,

    /// Edge pixel ratio below which the crop is considered plain
    pub min_edge_density: f64,

    pub min_stamp_width: i32,
    pub max_stamp_width: i32,
    pub min_stamp_height: i32,
    pub max_stamp_height: i32,

    /// Band width in pixels sampled along each crop side
    pub perforation_edge_band: i32,
    pub perforation_variance_high: f64,
    pub perforation_variance_low: f64,

    /// Trained SVM artifact (OpenCV XML/YAML)
    pub model_path: Option<PathBuf>,
}

/// Stage 1C fallback detector parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// YOLOv8 ONNX export
    pub model_path: PathBuf,

    pub confidence_threshold: f32,
    pub nms_threshold: f32,

    /// Square network input side
    pub input_size: i32,

    /// Number of class scores per prediction
    pub num_classes: i32,

    /// Fetch missing weights through the configured provisioner
    pub auto_provision: bool,

    pub min_area_ratio: f64,
    pub max_area_ratio: f64,

    pub aspect_ratio_min: f64,
    pub aspect_ratio_max: f64,
}

/// Stage 2 similarity search parameters.
///
/// `auto_threshold` must be strictly greater than `min_threshold`; this is
/// checked by [`SearchConfig::validate`], not on every query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub auto_threshold: f32,
    pub min_threshold: f32,
    pub default_top_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            polygon: PolygonConfig::default(),
            classifier: ClassifierConfig::default(),
            fallback: FallbackConfig::default(),
            enable_fallback: true,
        }
    }
}

impl Default for PolygonConfig {
    fn default() -> Self {
        Self {
            min_vertices: polygon::MIN_VERTICES,
            max_vertices: polygon::MAX_VERTICES,
            min_area_ratio: polygon::MIN_AREA_RATIO,
            max_area_ratio: polygon::MAX_AREA_RATIO,
            aspect_ratio_min: polygon::ASPECT_RATIO_MIN,
            aspect_ratio_max: polygon::ASPECT_RATIO_MAX,
            approx_epsilon: polygon::APPROX_EPSILON,
            blur_kernel_size: polygon::BLUR_KERNEL_SIZE,
            threshold_block_size: polygon::THRESHOLD_BLOCK_SIZE,
            threshold_c: polygon::THRESHOLD_C,
            require_convex: true,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mode: ClassifierMode::Heuristic,
            confidence_threshold: classifier::CONFIDENCE_THRESHOLD,
            color_variance_weight: classifier::COLOR_VARIANCE_WEIGHT,
            edge_complexity_weight: classifier::EDGE_COMPLEXITY_WEIGHT,
            size_weight: classifier::SIZE_WEIGHT,
            perforation_weight: classifier::PERFORATION_WEIGHT,
            min_color_variance: classifier::MIN_COLOR_VARIANCE,
            min_edge_density: classifier::MIN_EDGE_DENSITY,
            min_stamp_width: classifier::MIN_STAMP_WIDTH,
            max_stamp_width: classifier::MAX_STAMP_WIDTH,
            min_stamp_height: classifier::MIN_STAMP_HEIGHT,
            max_stamp_height: classifier::MAX_STAMP_HEIGHT,
            perforation_edge_band: classifier::PERFORATION_EDGE_BAND,
            perforation_variance_high: classifier::PERFORATION_VARIANCE_HIGH,
            perforation_variance_low: classifier::PERFORATION_VARIANCE_LOW,
            model_path: None,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(fallback::MODEL_PATH),
            confidence_threshold: fallback::CONFIDENCE_THRESHOLD,
            nms_threshold: fallback::NMS_THRESHOLD,
            input_size: fallback::INPUT_SIZE,
            num_classes: fallback::NUM_CLASSES,
            auto_provision: false,
            min_area_ratio: fallback::MIN_AREA_RATIO,
            max_area_ratio: fallback::MAX_AREA_RATIO,
            aspect_ratio_min: fallback::ASPECT_RATIO_MIN,
            aspect_ratio_max: fallback::ASPECT_RATIO_MAX,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            auto_threshold: search::AUTO_THRESHOLD,
            min_threshold: search::MIN_THRESHOLD,
            default_top_k: search::DEFAULT_TOP_K,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }

    /// Check every stage configuration
    pub fn validate(&self) -> Result<()> {
        self.polygon.validate()?;
        self.classifier.validate()?;
        self.fallback.validate()
    }
}

impl PolygonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_vertices < 3 || self.min_vertices > self.max_vertices {
            return Err(StampError::invalid_config(
                "min_vertices",
                self.min_vertices,
                "must be at least 3 and not exceed max_vertices",
            ));
        }
        if self.max_vertices > 4 {
            return Err(StampError::invalid_config(
                "max_vertices",
                self.max_vertices,
                "only triangles and quadrilaterals are supported",
            ));
        }
        check_ratio_range("min_area_ratio", self.min_area_ratio, self.max_area_ratio)?;
        check_ratio_range("aspect_ratio_min", self.aspect_ratio_min, self.aspect_ratio_max)?;
        check_odd("blur_kernel_size", self.blur_kernel_size)?;
        check_odd("threshold_block_size", self.threshold_block_size)?;
        if self.threshold_block_size < 3 {
            return Err(StampError::invalid_config(
                "threshold_block_size",
                self.threshold_block_size,
                "must be at least 3",
            ));
        }
        if self.approx_epsilon <= 0.0 {
            return Err(StampError::invalid_config(
                "approx_epsilon",
                self.approx_epsilon,
                "must be positive",
            ));
        }
        Ok(())
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(StampError::invalid_config(
                "confidence_threshold",
                self.confidence_threshold,
                "must be within [0, 1]",
            ));
        }
        for (name, weight) in [
            ("color_variance_weight", self.color_variance_weight),
            ("edge_complexity_weight", self.edge_complexity_weight),
            ("size_weight", self.size_weight),
            ("perforation_weight", self.perforation_weight),
        ] {
            if weight < 0.0 {
                return Err(StampError::invalid_config(name, weight, "must not be negative"));
            }
        }
        if self.min_stamp_width > self.max_stamp_width {
            return Err(StampError::invalid_config(
                "min_stamp_width",
                self.min_stamp_width,
                "must not exceed max_stamp_width",
            ));
        }
        if self.min_stamp_height > self.max_stamp_height {
            return Err(StampError::invalid_config(
                "min_stamp_height",
                self.min_stamp_height,
                "must not exceed max_stamp_height",
            ));
        }
        if self.perforation_variance_low > self.perforation_variance_high {
            return Err(StampError::invalid_config(
                "perforation_variance_low",
                self.perforation_variance_low,
                "must not exceed perforation_variance_high",
            ));
        }
        if self.perforation_edge_band < 1 {
            return Err(StampError::invalid_config(
                "perforation_edge_band",
                self.perforation_edge_band,
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Sum of the four heuristic weights
    pub fn weight_sum(&self) -> f64 {
        self.color_variance_weight
            + self.edge_complexity_weight
            + self.size_weight
            + self.perforation_weight
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(StampError::invalid_config(
                "confidence_threshold",
                self.confidence_threshold,
                "must be within [0, 1]",
            ));
        }
        if self.input_size <= 0 || self.input_size % 32 != 0 {
            return Err(StampError::invalid_config(
                "input_size",
                self.input_size,
                "must be a positive multiple of 32",
            ));
        }
        if self.num_classes <= 0 {
            return Err(StampError::invalid_config(
                "num_classes",
                self.num_classes,
                "must be positive",
            ));
        }
        check_ratio_range("min_area_ratio", self.min_area_ratio, self.max_area_ratio)?;
        check_ratio_range("aspect_ratio_min", self.aspect_ratio_min, self.aspect_ratio_max)
    }
}

impl SearchConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_threshold) {
            return Err(StampError::invalid_config(
                "min_threshold",
                self.min_threshold,
                "must be within [0, 1]",
            ));
        }
        if self.auto_threshold <= self.min_threshold || self.auto_threshold > 1.0 {
            return Err(StampError::invalid_config(
                "auto_threshold",
                self.auto_threshold,
                "must exceed min_threshold and not exceed 1",
            ));
        }
        if self.default_top_k == 0 {
            return Err(StampError::invalid_config(
                "default_top_k",
                self.default_top_k,
                "must be positive",
            ));
        }
        Ok(())
    }
}

fn check_ratio_range(parameter: &str, min: f64, max: f64) -> Result<()> {
    if min < 0.0 || min > max {
        return Err(StampError::invalid_config(
            parameter,
            min,
            format!("must be non-negative and not exceed {}", max),
        ));
    }
    Ok(())
}

fn check_odd(parameter: &str, value: i32) -> Result<()> {
    if value <= 0 || value % 2 == 0 {
        return Err(StampError::invalid_config(parameter, value, "must be a positive odd number"));
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| StampError::ConfigIo {
        path: path.display().to_string(),
        source: Box::new(e),
    })?;
    serde_json::from_str(&content).map_err(|e| StampError::ConfigIo {
        path: path.display().to_string(),
        source: Box::new(e),
    })
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StampError::ConfigIo {
        path: path.display().to_string(),
        source: Box::new(e),
    })?;
    std::fs::write(path, json).map_err(|e| StampError::ConfigIo {
        path: path.display().to_string(),
        source: Box::new(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(SearchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let config = ClassifierConfig::default();
        assert!((config.weight_sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_search_thresholds_must_be_ordered() {
        let config = SearchConfig {
            auto_threshold: 0.5,
            min_threshold: 0.5,
            ..SearchConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StampError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_polygon_rejects_pentagons() {
        let config = PolygonConfig {
            max_vertices: 5,
            ..PolygonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_edge_band_must_be_positive() {
        for band in [0, -4] {
            let config = ClassifierConfig {
                perforation_edge_band: band,
                ..ClassifierConfig::default()
            };
            match config.validate() {
                Err(StampError::InvalidConfig { parameter, .. }) => {
                    assert_eq!(parameter, "perforation_edge_band");
                }
                other => panic!("band {} gave {:?}", band, other),
            }
        }

        let narrow = ClassifierConfig {
            perforation_edge_band: 1,
            ..ClassifierConfig::default()
        };
        assert!(narrow.validate().is_ok());
    }

    #[test]
    fn test_even_block_size_rejected() {
        let config = PolygonConfig {
            threshold_block_size: 14,
            ..PolygonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "enable_fallback": false, "classifier": { "mode": "both" } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!(!config.enable_fallback);
        assert_eq!(config.classifier.mode, ClassifierMode::Both);
        assert_eq!(config.classifier.confidence_threshold, 0.6);
        assert_eq!(config.polygon, PolygonConfig::default());
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("stampscan-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pipeline.json");

        let mut config = PipelineConfig::default();
        config.polygon.min_area_ratio = 0.002;
        config.to_json_file(&path).unwrap();

        let loaded = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_config_io_error() {
        let result = SearchConfig::from_json_file(Path::new("/nonexistent/search.json"));
        assert!(matches!(result, Err(StampError::ConfigIo { .. })));
    }
}
