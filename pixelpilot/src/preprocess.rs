//! Image cleanup applied to a captured region before text recognition.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::integral_image::{integral_image, sum_image_pixels};
use imageproc::morphology::close;

/// Sigma giving an effective kernel of roughly 3x3.
const SMOOTHING_SIGMA: f32 = 0.85;
const THRESHOLD_BLOCK_RADIUS: u32 = 7;
/// How much darker than its neighbourhood a pixel must be to count as ink.
const THRESHOLD_OFFSET: f64 = 8.0;
/// Below this mean luminance the region is treated as light text on a dark background.
const DARK_BACKGROUND_MEAN: f64 = 110.0;

/// Grayscale input in, binarized black-ink-on-white out, same dimensions.
///
/// Pipeline: polarity normalization, Gaussian smoothing, adaptive mean
/// thresholding, then a 3x3 morphological closing over the ink to reconnect
/// broken glyph strokes.
pub fn prepare_for_ocr(gray: &GrayImage) -> GrayImage {
    if gray.width() == 0 || gray.height() == 0 {
        return gray.clone();
    }
    let mut normalized = gray.clone();
    if mean_luminance(gray) < DARK_BACKGROUND_MEAN {
        image::imageops::invert(&mut normalized);
    }

    let smoothed = gaussian_blur_f32(&normalized, SMOOTHING_SIGMA);
    let ink_mask = adaptive_ink_mask(&smoothed, THRESHOLD_BLOCK_RADIUS, THRESHOLD_OFFSET);
    // Closing operates on non-zero foreground, so ink is 255 in the mask.
    let mut closed = close(&ink_mask, Norm::LInf, 1);
    image::imageops::invert(&mut closed);
    closed
}

fn mean_luminance(gray: &GrayImage) -> f64 {
    let total: u64 = gray.pixels().map(|p| p[0] as u64).sum();
    total as f64 / (gray.width() as u64 * gray.height() as u64).max(1) as f64
}

/// Marks pixels darker than their local mean by more than `offset` with 255.
fn adaptive_ink_mask(gray: &GrayImage, radius: u32, offset: f64) -> GrayImage {
    let (width, height) = gray.dimensions();
    let integral = integral_image::<_, u64>(gray);
    GrayImage::from_fn(width, height, |x, y| {
        let (x0, y0) = (x.saturating_sub(radius), y.saturating_sub(radius));
        let (x1, y1) = ((x + radius).min(width - 1), (y + radius).min(height - 1));
        let count = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f64;
        let mean = sum_image_pixels(&integral, x0, y0, x1, y1)[0] as f64 / count;
        let value = gray.get_pixel(x, y)[0] as f64;
        Luma([if value < mean - offset { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INK: u8 = 0;
    const PAPER: u8 = 255;

    fn page_with_bar(gap_column: Option<u32>) -> GrayImage {
        let mut img = GrayImage::from_pixel(60, 30, Luma([220]));
        for y in 10..13 {
            for x in 10..40 {
                if Some(x) != gap_column {
                    img.put_pixel(x, y, Luma([20]));
                }
            }
        }
        img
    }

    #[test]
    fn dark_strokes_become_black_on_white() {
        let out = prepare_for_ocr(&page_with_bar(None));
        assert_eq!(out.dimensions(), (60, 30));
        assert_eq!(out.get_pixel(20, 11)[0], INK);
        assert_eq!(out.get_pixel(2, 2)[0], PAPER);
        assert_eq!(out.get_pixel(55, 25)[0], PAPER);
    }

    #[test]
    fn broken_stroke_is_reconnected() {
        let out = prepare_for_ocr(&page_with_bar(Some(25)));
        assert_eq!(out.get_pixel(25, 11)[0], INK);
    }

    #[test]
    fn light_text_on_dark_background_is_normalized() {
        let mut img = GrayImage::from_pixel(60, 30, Luma([30]));
        for y in 10..13 {
            for x in 10..40 {
                img.put_pixel(x, y, Luma([240]));
            }
        }
        let out = prepare_for_ocr(&img);
        assert_eq!(out.get_pixel(20, 11)[0], INK);
        assert_eq!(out.get_pixel(2, 2)[0], PAPER);
    }

    #[test]
    fn mask_uses_local_mean_with_offset() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([100]));
        img.put_pixel(4, 4, Luma([80]));
        img.put_pixel(0, 0, Luma([95]));
        let mask = adaptive_ink_mask(&img, 2, 8.0);
        assert_eq!(mask.get_pixel(4, 4)[0], 255);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(8, 8)[0], 0);
    }
}
