//! Stamp-likeness heuristics over a BGR crop
//!
//! Each check maps to a score in [0, 1]:
//! - Color variance: stamps are printed in color, blank paper is not
//! - Edge complexity: designs carry fine detail
//! - Size plausibility: typical stamp dimensions at album resolution
//! - Perforation hint: notched borders produce noisy edge bands

use opencv::{
    core::{count_non_zero, mean_std_dev_def, Mat, Rect, Vec3b},
    imgproc::{canny, cvt_color_def, COLOR_BGR2GRAY},
    prelude::*,
};
use palette::{FromColor, Lab, Srgb};

use crate::config::ClassifierConfig;
use crate::constants::classifier::{
    CANNY_HIGH_THRESHOLD, CANNY_LOW_THRESHOLD, IDEAL_STAMP_HEIGHT, IDEAL_STAMP_WIDTH,
    LOW_COLOR_SCORE, LOW_EDGE_SCORE, MAX_EXPECTED_COLOR_VARIANCE, MAX_EXPECTED_EDGE_DENSITY,
    MAX_SIZE_DEVIATION, OUT_OF_RANGE_SIZE_SCORE, PERFORATION_NEUTRAL_SCORE,
    PERFORATION_SMOOTH_SCORE, PERFORATION_STRONG_SCORE,
};
use crate::{Result, StampError};

/// Sum of per-channel variances in 8-bit Lab
///
/// L* is scaled to [0, 255] and a*/b* are offset by 128, so the value is on
/// the same scale as an OpenCV `COLOR_BGR2Lab` conversion of an 8-bit image.
pub fn lab_variance(crop: &Mat) -> Result<f64> {
    let pixels = crop.total() as f64;
    let mut sum = [0.0f64; 3];
    let mut sum_sq = [0.0f64; 3];

    for y in 0..crop.rows() {
        for x in 0..crop.cols() {
            let bgr = crop
                .at_2d::<Vec3b>(y, x)
                .map_err(|e| StampError::opencv("pixel access", e))?;
            let srgb = Srgb::new(
                bgr[2] as f32 / 255.0,
                bgr[1] as f32 / 255.0,
                bgr[0] as f32 / 255.0,
            );
            let lab = Lab::from_color(srgb);
            let scaled = [
                lab.l as f64 * 255.0 / 100.0,
                lab.a as f64 + 128.0,
                lab.b as f64 + 128.0,
            ];
            for channel in 0..3 {
                sum[channel] += scaled[channel];
                sum_sq[channel] += scaled[channel] * scaled[channel];
            }
        }
    }

    let variance = (0..3)
        .map(|c| {
            let mean = sum[c] / pixels;
            (sum_sq[c] / pixels - mean * mean).max(0.0)
        })
        .sum();
    Ok(variance)
}

pub fn color_variance_score(crop: &Mat, config: &ClassifierConfig) -> Result<f64> {
    let variance = lab_variance(crop)?;
    if variance < config.min_color_variance {
        return Ok(LOW_COLOR_SCORE);
    }
    Ok((variance / MAX_EXPECTED_COLOR_VARIANCE).min(1.0))
}

/// Canny edge map of the crop
pub fn edge_map(crop: &Mat) -> Result<Mat> {
    let mut gray = Mat::default();
    cvt_color_def(crop, &mut gray, COLOR_BGR2GRAY)
        .map_err(|e| StampError::opencv("grayscale conversion", e))?;

    let mut edges = Mat::default();
    canny(&gray, &mut edges, CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD, 3, false)
        .map_err(|e| StampError::opencv("Canny edge detection", e))?;
    Ok(edges)
}

/// Fraction of edge pixels
pub fn edge_density(edges: &Mat) -> Result<f64> {
    let edge_pixels =
        count_non_zero(edges).map_err(|e| StampError::opencv("edge pixel count", e))?;
    Ok(edge_pixels as f64 / edges.total() as f64)
}

pub fn edge_complexity_score(edges: &Mat, config: &ClassifierConfig) -> Result<f64> {
    let density = edge_density(edges)?;
    if density < config.min_edge_density {
        return Ok(LOW_EDGE_SCORE);
    }
    Ok((density / MAX_EXPECTED_EDGE_DENSITY).min(1.0))
}

pub fn size_score(width: i32, height: i32, config: &ClassifierConfig) -> f64 {
    let axis_score = |value: i32, min: i32, max: i32, ideal: f64| {
        if value < min || value > max {
            OUT_OF_RANGE_SIZE_SCORE
        } else {
            1.0 - ((value as f64 - ideal).abs() / ideal).min(MAX_SIZE_DEVIATION)
        }
    };

    let width_score = axis_score(
        width,
        config.min_stamp_width,
        config.max_stamp_width,
        IDEAL_STAMP_WIDTH,
    );
    let height_score = axis_score(
        height,
        config.min_stamp_height,
        config.max_stamp_height,
        IDEAL_STAMP_HEIGHT,
    );
    (width_score + height_score) / 2.0
}

/// Score edge-band noise along the four crop sides
///
/// Bands that do not fit inside the crop are skipped. Without any band the
/// result is neutral.
pub fn perforation_score(edges: &Mat, config: &ClassifierConfig) -> Result<f64> {
    let (rows, cols) = (edges.rows(), edges.cols());
    let band = config.perforation_edge_band;

    let mut bands = Vec::with_capacity(4);
    if rows > band {
        bands.push(Rect::new(0, 0, cols, band));
        bands.push(Rect::new(0, rows - band, cols, band));
    }
    if cols > band {
        bands.push(Rect::new(0, 0, band, rows));
        bands.push(Rect::new(cols - band, 0, band, rows));
    }

    if bands.is_empty() {
        return Ok(PERFORATION_NEUTRAL_SCORE);
    }

    let mut total = 0.0;
    for rect in &bands {
        total += region_variance(edges, *rect)?;
    }
    let mean_variance = total / bands.len() as f64;

    Ok(if mean_variance > config.perforation_variance_high {
        PERFORATION_STRONG_SCORE
    } else if mean_variance < config.perforation_variance_low {
        PERFORATION_SMOOTH_SCORE
    } else {
        PERFORATION_NEUTRAL_SCORE
    })
}

/// Population variance of a single-channel region
fn region_variance(image: &Mat, rect: Rect) -> Result<f64> {
    let region = Mat::roi(image, rect).map_err(|e| StampError::opencv("band region", e))?;

    let mut mean = Mat::default();
    let mut stddev = Mat::default();
    mean_std_dev_def(&region, &mut mean, &mut stddev)
        .map_err(|e| StampError::opencv("band statistics", e))?;

    let sigma = *stddev
        .at::<f64>(0)
        .map_err(|e| StampError::opencv("band statistics", e))?;
    Ok(sigma * sigma)
}
