// Turns one live frame into a square, vintage-filtered still.

use image::{imageops, ImageFormat, RgbImage};

use crate::camera::Facing;
use crate::errors::CaptureError;
use crate::vintage::{self, Rect};

/// An encoded square still, ready to travel as a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillImage {
    jpeg: Vec<u8>,
    side: u32,
}

impl StillImage {
    pub fn from_jpeg(jpeg: Vec<u8>, side: u32) -> Self {
        Self { jpeg, side }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn as_jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn into_jpeg(self) -> Vec<u8> {
        self.jpeg
    }

    pub fn decode(&self) -> Result<RgbImage, CaptureError> {
        image::load_from_memory_with_format(&self.jpeg, ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| CaptureError::DecodeFailed(e.to_string()))
    }
}

pub struct CaptureCompositor;

impl CaptureCompositor {
    /// Largest centred square of the frame, mirrored for front-facing cameras.
    pub fn square_crop(frame: &RgbImage, facing: Facing) -> Result<RgbImage, CaptureError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(CaptureError::EmptyFrame { width, height });
        }

        let size = width.min(height);
        let x = (width - size) / 2;
        let y = (height - size) / 2;
        let mut square = imageops::crop_imm(frame, x, y, size, size).to_image();

        if facing.is_mirrored() {
            imageops::flip_horizontal_in_place(&mut square);
        }
        Ok(square)
    }

    /// Crop, mirror, warm overlay and vignette, without encoding.
    pub fn develop(frame: &RgbImage, facing: Facing) -> Result<RgbImage, CaptureError> {
        let mut still = Self::square_crop(frame, facing)?;
        vintage::apply_warm_overlay(&mut still);
        let area = Rect::full(&still);
        vintage::apply_vignette(&mut still, area);
        Ok(still)
    }

    pub fn capture(frame: &RgbImage, facing: Facing) -> Result<StillImage, CaptureError> {
        let still = Self::develop(frame, facing)?;
        let jpeg = vintage::encode_jpeg(&still, vintage::JPEG_QUALITY)
            .map_err(|e| CaptureError::EncodeFailed(e.to_string()))?;
        Ok(StillImage::from_jpeg(jpeg, still.width()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;

    #[test]
    fn test_still_side_is_min_dimension() {
        for (w, h) in [(192, 108), (108, 192), (64, 64), (65, 40)] {
            let frame = SyntheticCamera::test_pattern(w, h);
            for facing in [Facing::Front, Facing::Back] {
                let still = CaptureCompositor::capture(&frame, facing).unwrap();
                assert_eq!(still.side(), w.min(h));
                let decoded = still.decode().unwrap();
                assert_eq!(decoded.dimensions(), (w.min(h), w.min(h)));
            }
        }
    }

    #[test]
    fn test_crop_is_centered() {
        let frame = SyntheticCamera::test_pattern(300, 100);
        let square = CaptureCompositor::square_crop(&frame, Facing::Back).unwrap();
        assert_eq!(square.get_pixel(0, 0), frame.get_pixel(100, 0));
        assert_eq!(square.get_pixel(99, 99), frame.get_pixel(199, 99));
    }

    #[test]
    fn test_front_is_mirror_of_back() {
        let frame = SyntheticCamera::test_pattern(160, 90);
        let back = CaptureCompositor::develop(&frame, Facing::Back).unwrap();
        let front = CaptureCompositor::develop(&frame, Facing::Front).unwrap();
        assert_ne!(back, front);
        assert_eq!(imageops::flip_horizontal(&back), front);
    }

    #[test]
    fn test_capture_is_deterministic() {
        let frame = SyntheticCamera::test_pattern(80, 60);
        let a = CaptureCompositor::capture(&frame, Facing::Front).unwrap();
        let b = CaptureCompositor::capture(&frame, Facing::Front).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let frame = RgbImage::new(0, 10);
        assert!(matches!(
            CaptureCompositor::capture(&frame, Facing::Back),
            Err(CaptureError::EmptyFrame { width: 0, height: 10 })
        ));
    }
}
