//! Conversions between OpenCV crops and encoded images
//!
//! Detection works on BGR `Mat`s while the describer expects JPEG bytes.
//! Decoding and encoding go through the `image` crate.

use std::borrow::Cow;
use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};
use opencv::{
    core::{Mat, Vec3b, CV_8U, CV_8UC3},
    imgproc::{cvt_color_def, COLOR_BGRA2BGR, COLOR_GRAY2BGR},
    prelude::*,
};

use crate::constants::CROP_JPEG_QUALITY;
use crate::{Result, StampError};

/// Load an image file as a BGR `Mat`
///
/// # Example
///
/// ```rust,no_run
/// use stampscan::crop::load_image;
/// use std::path::Path;
///
/// let mat = load_image(Path::new("album_page.jpg"))?;
/// # Ok::<(), stampscan::StampError>(())
/// ```
pub fn load_image(path: &Path) -> Result<Mat> {
    let reader = ImageReader::open(path).map_err(|e| {
        StampError::image_load(format!("Failed to open image file: {}", path.display()), e)
    })?;

    let reader = reader.with_guessed_format().map_err(|e| {
        StampError::image_load(format!("Failed to detect image format: {}", path.display()), e)
    })?;

    let img = reader.decode().map_err(|e| {
        StampError::image_load(format!("Failed to decode image: {}", path.display()), e)
    })?;

    mat_from_rgb(&img.to_rgb8())
}

/// Normalize an 8-bit image to three-channel BGR
///
/// Grayscale and BGRA inputs are converted; BGR input is borrowed as is.
pub fn ensure_bgr(image: &Mat) -> Result<Cow<'_, Mat>> {
    if image.empty() {
        return Err(StampError::InvalidImage {
            reason: "image is empty".into(),
        });
    }
    if image.depth() != CV_8U {
        return Err(StampError::InvalidImage {
            reason: format!("unsupported pixel depth {}", image.depth()),
        });
    }

    let code = match image.channels() {
        3 => return Ok(Cow::Borrowed(image)),
        1 => COLOR_GRAY2BGR,
        4 => COLOR_BGRA2BGR,
        n => {
            return Err(StampError::InvalidImage {
                reason: format!("unsupported channel count {}", n),
            })
        }
    };

    let mut bgr = Mat::default();
    cvt_color_def(image, &mut bgr, code).map_err(|e| StampError::opencv("BGR normalization", e))?;
    Ok(Cow::Owned(bgr))
}

/// Convert an RGB image buffer to an OpenCV BGR `Mat`
pub fn mat_from_rgb(rgb: &RgbImage) -> Result<Mat> {
    let (width, height) = rgb.dimensions();
    let (width, height) = (width as i32, height as i32);
    if width == 0 || height == 0 {
        return Err(StampError::InvalidImage {
            reason: format!("image has no pixels ({}x{})", width, height),
        });
    }

    let mut mat = Mat::zeros(height, width, CV_8UC3)
        .and_then(|m| m.to_mat())
        .map_err(|e| StampError::opencv("Mat allocation", e))?;

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let bgr = mat
            .at_2d_mut::<Vec3b>(y as i32, x as i32)
            .map_err(|e| StampError::opencv("pixel access", e))?;
        bgr[0] = pixel[2];
        bgr[1] = pixel[1];
        bgr[2] = pixel[0];
    }

    Ok(mat)
}

/// Convert a BGR `Mat` to an RGB image buffer
pub fn mat_to_rgb(mat: &Mat) -> Result<RgbImage> {
    if mat.empty() {
        return Err(StampError::DegenerateCrop {
            width: mat.cols(),
            height: mat.rows(),
        });
    }
    if mat.typ() != CV_8UC3 {
        return Err(StampError::InvalidImage {
            reason: format!("expected 8-bit BGR crop, got {} channels", mat.channels()),
        });
    }

    let mut rgb = RgbImage::new(mat.cols() as u32, mat.rows() as u32);
    for y in 0..mat.rows() {
        for x in 0..mat.cols() {
            let bgr = mat
                .at_2d::<Vec3b>(y, x)
                .map_err(|e| StampError::opencv("pixel access", e))?;
            rgb.put_pixel(x as u32, y as u32, image::Rgb([bgr[2], bgr[1], bgr[0]]));
        }
    }

    Ok(rgb)
}

/// Encode a BGR crop as JPEG bytes for the describer
pub fn encode_jpeg(crop: &Mat) -> Result<Vec<u8>> {
    encode_jpeg_with_quality(crop, CROP_JPEG_QUALITY)
}

pub fn encode_jpeg_with_quality(crop: &Mat, quality: u8) -> Result<Vec<u8>> {
    let rgb = mat_to_rgb(crop)?;

    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&rgb)
        .map_err(|e| StampError::encoding("JPEG encoding failed", e))?;

    Ok(buffer.into_inner())
}
