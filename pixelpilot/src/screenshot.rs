use crate::descriptor::BoundingBox;
use crate::errors::LocateError;
use chrono::{DateTime, Utc};
use image::{imageops, GrayImage, RgbaImage};
use std::path::Path;
use std::sync::Arc;

/// A full-screen capture. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Screenshot {
    image: Arc<RgbaImage>,
    captured_at: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: Utc::now(),
        }
    }

    /// Rebuilds a screenshot from raw RGBA bytes.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, LocateError> {
        let image = RgbaImage::from_raw(width, height, data).ok_or_else(|| {
            LocateError::TransientIo(format!(
                "raw buffer does not hold a {width}x{height} RGBA image"
            ))
        })?;
        Ok(Self::new(image))
    }

    pub fn load(path: &Path) -> Result<Self, LocateError> {
        let image = image::open(path).map_err(|e| {
            LocateError::TransientIo(format!("failed to load {}: {e}", path.display()))
        })?;
        Ok(Self::new(image.to_rgba8()))
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(0, 0, self.width(), self.height())
    }

    /// Intersects `region` with the screen. `None` when nothing overlaps.
    pub fn clamp_region(&self, region: BoundingBox) -> Option<BoundingBox> {
        let x0 = region.x.max(0) as i64;
        let y0 = region.y.max(0) as i64;
        let x1 = (region.x as i64 + region.width as i64).min(self.width() as i64);
        let y1 = (region.y as i64 + region.height as i64).min(self.height() as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(BoundingBox::new(
            x0 as i32,
            y0 as i32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        ))
    }

    /// Grayscale copy of `region` (or the whole screen) plus the region actually used.
    pub fn gray_region(&self, region: Option<BoundingBox>) -> Option<(GrayImage, BoundingBox)> {
        let area = match region {
            Some(r) => self.clamp_region(r)?,
            None => self.bounds(),
        };
        let crop = imageops::crop_imm(
            &*self.image,
            area.x as u32,
            area.y as u32,
            area.width,
            area.height,
        )
        .to_image();
        Some((imageops::grayscale(&crop), area))
    }

    pub fn save_png(&self, path: &Path) -> Result<(), image::ImageError> {
        self.image.save_with_format(path, image::ImageFormat::Png)
    }

    /// Fraction of pixels whose color differs from `other`. Different sizes count as fully changed.
    pub fn changed_fraction(&self, other: &Screenshot) -> f32 {
        if self.image.dimensions() != other.image.dimensions() {
            return 1.0;
        }
        let total = (self.width() as u64 * self.height() as u64).max(1);
        let changed = self
            .image
            .pixels()
            .zip(other.image.pixels())
            .filter(|(a, b)| a != b)
            .count() as u64;
        changed as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn clamp_region_trims_to_screen() {
        let shot = Screenshot::new(RgbaImage::new(100, 50));
        assert_eq!(
            shot.clamp_region(BoundingBox::new(-10, 40, 30, 30)),
            Some(BoundingBox::new(0, 40, 20, 10))
        );
        assert_eq!(shot.clamp_region(BoundingBox::new(200, 0, 10, 10)), None);
    }

    #[test]
    fn changed_fraction_counts_differing_pixels() {
        let before = Screenshot::new(RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255])));
        let mut pixels = before.image().clone();
        for x in 0..10 {
            pixels.put_pixel(x, 0, Rgba([255, 255, 255, 255]));
        }
        let after = Screenshot::new(pixels);
        assert!((before.changed_fraction(&after) - 0.1).abs() < 1e-6);
        assert_eq!(before.changed_fraction(&before.clone()), 0.0);
    }

    #[test]
    fn from_raw_rejects_short_buffer() {
        assert!(Screenshot::from_raw(4, 4, vec![0; 10]).is_err());
        assert!(Screenshot::from_raw(2, 2, vec![0; 16]).is_ok());
    }
}
