//! Grayscale measurements shared by the quality filter and the heuristic
//! liveness strategy.

use image::{GrayImage, RgbImage};

/// Luminance of an RGB crop, using the `image` crate's luma weights.
pub fn luma(crop: &RgbImage) -> GrayImage {
    image::imageops::grayscale(crop)
}

/// Variance of the 4-neighbour Laplacian response over interior pixels.
///
/// Sharp, textured crops score high; defocused or motion-blurred crops and
/// flat surfaces score near zero. Images smaller than 3×3 have no interior
/// and score 0.0.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = gray.as_raw();
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = px[y * w + x] as f64;
            let response = px[(y - 1) * w + x] as f64
                + px[(y + 1) * w + x] as f64
                + px[y * w + x - 1] as f64
                + px[y * w + x + 1] as f64
                - 4.0 * c;
            sum += response;
            sum_sq += response * response;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    ((sum_sq / n as f64) - mean * mean).max(0.0) as f32
}

/// Population standard deviation of pixel intensities (grayscale contrast).
pub fn intensity_stddev(gray: &GrayImage) -> f32 {
    let px = gray.as_raw();
    if px.is_empty() {
        return 0.0;
    }
    let n = px.len() as f64;
    let mean = px.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = px.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() as f32
}
