//! Stage 1C: ML fallback detection
//!
//! Runs a general object detector (YOLOv8 exported to ONNX, executed through
//! OpenCV DNN) when geometric detection finds nothing. The network is loaded
//! lazily on first use through an injectable [`DetectorFactory`], so tests can
//! substitute a stub and deployments without weights degrade to no detections.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use opencv::{
    core::{Mat, Rect, Scalar, Size, Vector, CV_32F},
    dnn::{self, Net},
    prelude::*,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::FallbackConfig;
use crate::detection::types::{BoundingBox, DetectedBox};
use crate::{Result, StampError};

/// A scored box before cropping and stamp filtering
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: i32,
}

/// Object detector producing boxes in image coordinates
pub trait BoxDetector: Send + Sync {
    /// Boxes at or above the detector's confidence threshold, after NMS
    fn detect(&self, image: &Mat) -> Result<Vec<ScoredBox>>;
}

/// Creates the detector on first use
pub trait DetectorFactory: Send + Sync {
    fn create(&self, config: &FallbackConfig) -> Result<Box<dyn BoxDetector>>;
}

/// Fetches model weights that are missing locally
pub trait ModelProvisioner: Send + Sync {
    /// Place the model file at `target`
    fn provision(&self, target: &Path) -> Result<()>;
}

/// Provisions weights by copying them from a local model cache
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    cache_dir: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }
}

impl ModelProvisioner for DirectoryProvisioner {
    fn provision(&self, target: &Path) -> Result<()> {
        let file_name = target.file_name().ok_or_else(|| StampError::ModelLoad {
            message: format!("model path has no file name: {}", target.display()),
            source: None,
        })?;
        let cached = self.cache_dir.join(file_name);
        if !cached.exists() {
            return Err(StampError::ModelLoad {
                message: format!("model not present in cache: {}", cached.display()),
                source: None,
            });
        }

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StampError::model_load("failed to create model directory", e))?;
        }
        fs::copy(&cached, target)
            .map_err(|e| StampError::model_load("failed to copy model from cache", e))?;

        info!(from = %cached.display(), to = %target.display(), "provisioned fallback model");
        Ok(())
    }
}

/// Loads YOLOv8 ONNX weights into an OpenCV DNN network
#[derive(Default, Clone)]
pub struct OnnxDetectorFactory {
    provisioner: Option<Arc<dyn ModelProvisioner>>,
}

impl OnnxDetectorFactory {
    pub fn with_provisioner(provisioner: Arc<dyn ModelProvisioner>) -> Self {
        Self {
            provisioner: Some(provisioner),
        }
    }
}

impl DetectorFactory for OnnxDetectorFactory {
    fn create(&self, config: &FallbackConfig) -> Result<Box<dyn BoxDetector>> {
        let path = &config.model_path;
        if !path.exists() {
            match (&self.provisioner, config.auto_provision) {
                (Some(provisioner), true) => provisioner.provision(path)?,
                _ => {
                    return Err(StampError::ModelLoad {
                        message: format!(
                            "fallback model not found at {} and auto-provisioning disabled",
                            path.display()
                        ),
                        source: None,
                    })
                }
            }
        }

        Ok(Box::new(OnnxBoxDetector::load(config)?))
    }
}

/// YOLOv8 detector running on OpenCV DNN
pub struct OnnxBoxDetector {
    net: Mutex<Net>,
    confidence_threshold: f32,
    nms_threshold: f32,
    input_size: i32,
    num_classes: i32,
}

impl OnnxBoxDetector {
    pub fn load(config: &FallbackConfig) -> Result<Self> {
        let path = config.model_path.to_str().ok_or_else(|| StampError::ModelLoad {
            message: format!("model path is not valid UTF-8: {}", config.model_path.display()),
            source: None,
        })?;
        let net = dnn::read_net_from_onnx(path)
            .map_err(|e| StampError::model_load("failed to read ONNX model", e))?;

        debug!(path, "loaded fallback detector");
        Ok(Self {
            net: Mutex::new(net),
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
            input_size: config.input_size,
            num_classes: config.num_classes,
        })
    }

    fn forward(&self, image: &Mat) -> Result<Mat> {
        let blob = dnn::blob_from_image(
            image,
            1.0 / 255.0,
            Size::new(self.input_size, self.input_size),
            Scalar::default(),
            true,
            false,
            CV_32F,
        )
        .map_err(|e| StampError::opencv("blob creation", e))?;

        let mut net = self.net.lock();
        net.set_input_def(&blob)
            .map_err(|e| StampError::opencv("network input", e))?;

        let names = net
            .get_unconnected_out_layers_names()
            .map_err(|e| StampError::opencv("output layer lookup", e))?;
        let mut outputs = Vector::<Mat>::new();
        net.forward(&mut outputs, &names)
            .map_err(|e| StampError::opencv("forward pass", e))?;

        outputs
            .get(0)
            .map_err(|e| StampError::opencv("network output", e))
    }
}

impl BoxDetector for OnnxBoxDetector {
    fn detect(&self, image: &Mat) -> Result<Vec<ScoredBox>> {
        let output = self.forward(image)?;

        // [1, 4 + classes, anchors] -> [4 + classes, anchors]
        let rows = 4 + self.num_classes;
        let predictions = output
            .reshape(1, rows)
            .map_err(|e| StampError::opencv("output reshape", e))?;

        let x_scale = image.cols() as f32 / self.input_size as f32;
        let y_scale = image.rows() as f32 / self.input_size as f32;
        let at = |row: i32, col: i32| -> Result<f32> {
            predictions
                .at_2d::<f32>(row, col)
                .copied()
                .map_err(|e| StampError::opencv("output access", e))
        };

        let mut boxes = Vector::<Rect>::new();
        let mut scores = Vector::<f32>::new();
        let mut class_ids = Vec::new();

        for anchor in 0..predictions.cols() {
            let mut best_score = 0.0f32;
            let mut best_class = 0;
            for class in 0..self.num_classes {
                let score = at(4 + class, anchor)?;
                if score > best_score {
                    best_score = score;
                    best_class = class;
                }
            }
            if best_score < self.confidence_threshold {
                continue;
            }

            let cx = at(0, anchor)? * x_scale;
            let cy = at(1, anchor)? * y_scale;
            let w = at(2, anchor)? * x_scale;
            let h = at(3, anchor)? * y_scale;

            boxes.push(Rect::new(
                (cx - w / 2.0).round() as i32,
                (cy - h / 2.0).round() as i32,
                w.round() as i32,
                h.round() as i32,
            ));
            scores.push(best_score);
            class_ids.push(best_class);
        }

        let mut keep = Vector::<i32>::new();
        dnn::nms_boxes(
            &boxes,
            &scores,
            self.confidence_threshold,
            self.nms_threshold,
            &mut keep,
            1.0,
            0,
        )
        .map_err(|e| StampError::opencv("non-maximum suppression", e))?;

        let mut detections = Vec::with_capacity(keep.len());
        for index in keep.iter() {
            let index = index as usize;
            let rect = boxes
                .get(index)
                .map_err(|e| StampError::opencv("box access", e))?;
            let confidence = scores
                .get(index)
                .map_err(|e| StampError::opencv("score access", e))?;
            detections.push(ScoredBox {
                bbox: BoundingBox::from(rect).clamp_to(image.cols(), image.rows()),
                confidence,
                class_id: class_ids[index],
            });
        }

        Ok(detections)
    }
}

/// Fallback detector with a lazily created model
pub struct FallbackDetector {
    config: FallbackConfig,
    factory: Arc<dyn DetectorFactory>,
    detector: OnceLock<Option<Box<dyn BoxDetector>>>,
}

impl std::fmt::Debug for FallbackDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackDetector")
            .field("config", &self.config)
            .field("loaded", &self.detector.get().map(Option::is_some))
            .finish()
    }
}

impl FallbackDetector {
    /// Create a detector backed by the ONNX model in `config`
    pub fn new(config: FallbackConfig) -> Self {
        Self::with_factory(config, Arc::new(OnnxDetectorFactory::default()))
    }

    pub fn with_factory(config: FallbackConfig, factory: Arc<dyn DetectorFactory>) -> Self {
        Self {
            config,
            factory,
            detector: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Load the model if needed and report whether it is usable
    pub fn is_available(&self) -> bool {
        self.detector().is_some()
    }

    fn detector(&self) -> Option<&dyn BoxDetector> {
        self.detector
            .get_or_init(|| match self.factory.create(&self.config) {
                Ok(detector) => Some(detector),
                Err(e) => {
                    warn!(error = %e, "fallback detector unavailable");
                    None
                }
            })
            .as_deref()
    }

    /// Detect stamp-sized boxes
    ///
    /// Returns an empty list when the model is unavailable or inference fails.
    pub fn detect(&self, image: &Mat) -> Vec<DetectedBox> {
        let image_area = image.rows() as f64 * image.cols() as f64;
        let detections: Vec<DetectedBox> = self
            .run(image)
            .into_iter()
            .filter(|scored| self.is_stamp_sized(&scored.bbox, image_area))
            .filter_map(|scored| crop_box(image, scored))
            .collect();

        info!(boxes = detections.len(), "fallback detected potential stamps");
        detections
    }

    /// Detect all boxes without stamp size filtering
    pub fn detect_unfiltered(&self, image: &Mat) -> Vec<DetectedBox> {
        self.run(image)
            .into_iter()
            .filter_map(|scored| crop_box(image, scored))
            .collect()
    }

    fn run(&self, image: &Mat) -> Vec<ScoredBox> {
        let Some(detector) = self.detector() else {
            return Vec::new();
        };
        match detector.detect(image) {
            Ok(boxes) => boxes,
            Err(e) => {
                warn!(error = %e, "fallback detection failed");
                Vec::new()
            }
        }
    }

    fn is_stamp_sized(&self, bbox: &BoundingBox, image_area: f64) -> bool {
        if image_area <= 0.0 {
            return false;
        }
        let area_ratio = bbox.area() as f64 / image_area;
        let aspect = bbox.aspect_ratio();
        area_ratio >= self.config.min_area_ratio
            && area_ratio <= self.config.max_area_ratio
            && aspect >= self.config.aspect_ratio_min
            && aspect <= self.config.aspect_ratio_max
    }
}

fn crop_box(image: &Mat, scored: ScoredBox) -> Option<DetectedBox> {
    let bbox = scored.bbox.clamp_to(image.cols(), image.rows());
    if bbox.width <= 0 || bbox.height <= 0 {
        return None;
    }
    let crop = Mat::roi(image, bbox.to_rect()).and_then(|roi| roi.try_clone());
    match crop {
        Ok(crop) => Some(DetectedBox {
            bbox,
            confidence: scored.confidence,
            class_id: scored.class_id,
            crop,
        }),
        Err(e) => {
            warn!(error = %e, "failed to crop fallback box");
            None
        }
    }
}
