//! Stage 1A: geometric stamp candidate extraction
//!
//! Finds stamp-shaped polygons on album pages:
//! - Adaptive thresholding tolerant of uneven lighting
//! - Outer contour extraction and Douglas-Peucker approximation
//! - Area, vertex count, convexity and aspect ratio filters
//! - Perspective rectification of quadrilaterals, masked crops of triangles

use opencv::{
    core::{Mat, Point, Point2f, Rect, Scalar, Size, Vector, BORDER_CONSTANT, CV_8UC1, CV_8UC3},
    imgproc::{
        adaptive_threshold, approx_poly_dp, arc_length, bounding_rect, contour_area, cvt_color_def,
        fill_poly_def, find_contours_def, gaussian_blur_def, get_perspective_transform_def,
        get_structuring_element_def, is_contour_convex, morphology_ex_def, warp_perspective,
        ADAPTIVE_THRESH_GAUSSIAN_C, CHAIN_APPROX_SIMPLE, COLOR_BGR2GRAY, INTER_LINEAR, MORPH_CLOSE,
        MORPH_OPEN, MORPH_RECT, RETR_EXTERNAL, THRESH_BINARY_INV,
    },
    prelude::*,
};
use tracing::{debug, warn};

use crate::config::PolygonConfig;
use crate::constants::polygon::{MIN_RECTIFIED_SIDE, MORPH_KERNEL_SIZE, TRIANGLE_PADDING};
use crate::detection::types::{BoundingBox, CandidatePolygon, ShapeKind};
use crate::{Result, StampError};

type VectorOfPoint = Vector<Point>;
type VectorOfPoint2f = Vector<Point2f>;

/// Polygon detector for triangle and quadrilateral stamps
#[derive(Debug, Clone, Default)]
pub struct PolygonDetector {
    config: PolygonConfig,
}

impl PolygonDetector {
    pub fn new(config: PolygonConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolygonConfig {
        &self.config
    }

    /// Detect stamp-shaped polygons in a BGR image
    ///
    /// # Errors
    ///
    /// Returns `StampError` only if the image itself cannot be
    /// preprocessed. A contour that fails later processing is skipped.
    pub fn detect(&self, image: &Mat) -> Result<Vec<CandidatePolygon>> {
        if image.empty() {
            return Err(StampError::InvalidImage {
                reason: "image is empty".into(),
            });
        }

        // Step 1: Grayscale, blur, threshold, morphology
        let binary = self.preprocess(image)?;

        // Step 2: Outer contours
        let mut contours = Vector::<VectorOfPoint>::new();
        find_contours_def(&binary, &mut contours, RETR_EXTERNAL, CHAIN_APPROX_SIMPLE)
            .map_err(|e| StampError::opencv("contour detection", e))?;
        debug!(contours = contours.len(), "found contours");

        // Step 3: Filter and rectify each contour
        let image_area = image.rows() as f64 * image.cols() as f64;
        let mut polygons = Vec::new();
        for (index, contour) in contours.iter().enumerate() {
            match self.process_contour(&contour, image, image_area) {
                Ok(Some(polygon)) => polygons.push(polygon),
                Ok(None) => {}
                Err(e) => warn!(contour = index, error = %e, "skipping contour"),
            }
        }

        debug!(candidates = polygons.len(), "detected stamp-like polygons");
        Ok(polygons)
    }

    /// Binary foreground map of the image
    fn preprocess(&self, image: &Mat) -> Result<Mat> {
        let mut gray = Mat::default();
        cvt_color_def(image, &mut gray, COLOR_BGR2GRAY)
            .map_err(|e| StampError::opencv("grayscale conversion", e))?;

        let ksize = self.config.blur_kernel_size;
        let mut blurred = Mat::default();
        gaussian_blur_def(&gray, &mut blurred, Size::new(ksize, ksize), 0.0)
            .map_err(|e| StampError::opencv("Gaussian blur", e))?;

        let mut binary = Mat::default();
        adaptive_threshold(
            &blurred,
            &mut binary,
            255.0,
            ADAPTIVE_THRESH_GAUSSIAN_C,
            THRESH_BINARY_INV,
            self.config.threshold_block_size,
            self.config.threshold_c,
        )
        .map_err(|e| StampError::opencv("adaptive threshold", e))?;

        let kernel = get_structuring_element_def(
            MORPH_RECT,
            Size::new(MORPH_KERNEL_SIZE, MORPH_KERNEL_SIZE),
        )
        .map_err(|e| StampError::opencv("kernel creation", e))?;

        // Closing: bridge gaps in borders
        let mut closed = Mat::default();
        morphology_ex_def(&binary, &mut closed, MORPH_CLOSE, &kernel)
            .map_err(|e| StampError::opencv("closing", e))?;

        // Opening: remove speckle
        let mut opened = Mat::default();
        morphology_ex_def(&closed, &mut opened, MORPH_OPEN, &kernel)
            .map_err(|e| StampError::opencv("opening", e))?;

        Ok(opened)
    }

    fn process_contour(
        &self,
        contour: &VectorOfPoint,
        image: &Mat,
        image_area: f64,
    ) -> Result<Option<CandidatePolygon>> {
        let area =
            contour_area(contour, false).map_err(|e| StampError::opencv("contour area", e))?;
        let min_area = image_area * self.config.min_area_ratio;
        let max_area = image_area * self.config.max_area_ratio;
        if area < min_area || area > max_area {
            return Ok(None);
        }

        let perimeter =
            arc_length(contour, true).map_err(|e| StampError::opencv("perimeter", e))?;
        let mut approx = VectorOfPoint::new();
        approx_poly_dp(contour, &mut approx, self.config.approx_epsilon * perimeter, true)
            .map_err(|e| StampError::opencv("polygon approximation", e))?;

        let vertex_count = approx.len();
        if vertex_count < self.config.min_vertices || vertex_count > self.config.max_vertices {
            return Ok(None);
        }

        if self.config.require_convex
            && !is_contour_convex(&approx).map_err(|e| StampError::opencv("convexity check", e))?
        {
            return Ok(None);
        }

        let rect = bounding_rect(&approx).map_err(|e| StampError::opencv("bounding rect", e))?;
        let bbox = BoundingBox::from(rect);
        let aspect_ratio = bbox.aspect_ratio();
        if aspect_ratio < self.config.aspect_ratio_min
            || aspect_ratio > self.config.aspect_ratio_max
        {
            return Ok(None);
        }

        let shape = ShapeKind::from_vertex_count(vertex_count);
        let crop = match shape {
            ShapeKind::Triangle => extract_triangle_crop(&approx, image)?,
            ShapeKind::Quadrilateral => extract_quad_crop(&approx, image)?,
        };

        Ok(Some(CandidatePolygon {
            vertices: approx.to_vec(),
            bbox,
            shape,
            area,
            aspect_ratio,
            crop,
        }))
    }
}

/// Padded bounding box on a white canvas, keeping only pixels inside the triangle
fn extract_triangle_crop(vertices: &VectorOfPoint, image: &Mat) -> Result<Mat> {
    let rect = bounding_rect(vertices).map_err(|e| StampError::opencv("bounding rect", e))?;
    let padded = padded_rect(rect, TRIANGLE_PADDING, image.cols(), image.rows());
    if padded.width <= 0 || padded.height <= 0 {
        return Err(StampError::DegenerateCrop {
            width: padded.width,
            height: padded.height,
        });
    }

    let mut crop =
        Mat::new_rows_cols_with_default(padded.height, padded.width, CV_8UC3, Scalar::all(255.0))
            .map_err(|e| StampError::opencv("canvas allocation", e))?;

    let mut mask = Mat::zeros(padded.height, padded.width, CV_8UC1)
        .and_then(|m| m.to_mat())
        .map_err(|e| StampError::opencv("mask allocation", e))?;

    let shifted: VectorOfPoint = vertices
        .iter()
        .map(|p| Point::new(p.x - padded.x, p.y - padded.y))
        .collect();
    let mut polygons = Vector::<VectorOfPoint>::new();
    polygons.push(shifted);
    fill_poly_def(&mut mask, &polygons, Scalar::all(255.0))
        .map_err(|e| StampError::opencv("triangle mask", e))?;

    let roi = Mat::roi(image, padded).map_err(|e| StampError::opencv("crop region", e))?;
    roi.copy_to_masked(&mut crop, &mask)
        .map_err(|e| StampError::opencv("masked copy", e))?;

    Ok(crop)
}

/// Homography warp of the quadrilateral onto an upright rectangle
fn extract_quad_crop(vertices: &VectorOfPoint, image: &Mat) -> Result<Mat> {
    let corners: Vec<Point2f> = vertices
        .iter()
        .map(|p| Point2f::new(p.x as f32, p.y as f32))
        .collect();
    let ordered = order_corners(&corners)?;
    let (width, height) = compute_output_size(&ordered);

    let src = VectorOfPoint2f::from_iter(ordered);
    let dst = VectorOfPoint2f::from_iter([
        Point2f::new(0.0, 0.0),
        Point2f::new((width - 1) as f32, 0.0),
        Point2f::new((width - 1) as f32, (height - 1) as f32),
        Point2f::new(0.0, (height - 1) as f32),
    ]);

    let homography = get_perspective_transform_def(&src, &dst)
        .map_err(|e| StampError::opencv("homography computation", e))?;

    let mut rectified = Mat::default();
    warp_perspective(
        image,
        &mut rectified,
        &homography,
        Size::new(width, height),
        INTER_LINEAR,
        BORDER_CONSTANT,
        Scalar::default(),
    )
    .map_err(|e| StampError::opencv("perspective warp", e))?;

    Ok(rectified)
}

/// Order corners TL, TR, BR, BL: sort by y, then top pair by x ascending
/// and bottom pair by x descending
fn order_corners(corners: &[Point2f]) -> Result<[Point2f; 4]> {
    if corners.len() != 4 {
        return Err(StampError::InvalidImage {
            reason: format!("expected 4 corners, got {}", corners.len()),
        });
    }

    let mut by_y = corners.to_vec();
    by_y.sort_by(|a, b| a.y.total_cmp(&b.y));

    let (mut top, mut bottom) = ([by_y[0], by_y[1]], [by_y[2], by_y[3]]);
    top.sort_by(|a, b| a.x.total_cmp(&b.x));
    bottom.sort_by(|a, b| b.x.total_cmp(&a.x));

    Ok([top[0], top[1], bottom[0], bottom[1]])
}

/// Rectified size: longest horizontal and vertical edges, at least the minimum side
fn compute_output_size(corners: &[Point2f; 4]) -> (i32, i32) {
    let [tl, tr, br, bl] = *corners;
    let distance = |a: Point2f, b: Point2f| ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt();

    let width = distance(tl, tr).max(distance(br, bl)) as i32;
    let height = distance(tl, bl).max(distance(tr, br)) as i32;

    (width.max(MIN_RECTIFIED_SIDE), height.max(MIN_RECTIFIED_SIDE))
}

fn padded_rect(rect: Rect, padding: i32, image_width: i32, image_height: i32) -> Rect {
    let x = (rect.x - padding).max(0);
    let y = (rect.y - padding).max(0);
    let width = (rect.width + 2 * padding).min(image_width - x);
    let height = (rect.height + 2 * padding).min(image_height - y);
    Rect::new(x, y, width, height)
}
