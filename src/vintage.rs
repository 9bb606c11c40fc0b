// Vintage print look shared by live capture and high-res export.
// Every function here is pure per-pixel math over an RGB buffer.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageResult, RgbImage};

/// Warm tint painted over captures with an overlay blend.
pub const WARM_TINT: [f32; 3] = [255.0, 240.0, 200.0];
pub const WARM_ALPHA: f32 = 0.15;

/// Vignette opacity reached at the outer radius and beyond.
pub const VIGNETTE_ALPHA: f32 = 0.2;

/// On-screen print tone: `contrast(1.1) sepia(0.2)`.
pub const PRINT_CONTRAST: f32 = 1.1;
pub const PRINT_SEPIA: f32 = 0.2;

pub const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(img: &RgbImage) -> Self {
        Self::new(0, 0, img.width(), img.height())
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

fn overlay_channel(backdrop: f32, source: f32) -> f32 {
    if backdrop <= 0.5 {
        2.0 * backdrop * source
    } else {
        1.0 - 2.0 * (1.0 - backdrop) * (1.0 - source)
    }
}

fn to_unit(v: u8) -> f32 {
    v as f32 / 255.0
}

fn from_unit(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Blends the warm tint over the whole image in overlay mode.
pub fn apply_warm_overlay(img: &mut RgbImage) {
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            let backdrop = to_unit(pixel[c]);
            let blended = overlay_channel(backdrop, WARM_TINT[c] / 255.0);
            pixel[c] = from_unit(backdrop * (1.0 - WARM_ALPHA) + blended * WARM_ALPHA);
        }
    }
}

/// Vignette opacity at `distance` from the centre of an area whose short side is `short_side`.
///
/// Transparent inside a third of the short side, ramping linearly to
/// `VIGNETTE_ALPHA` at the full short side and holding there beyond it.
pub fn vignette_alpha(distance: f32, short_side: f32) -> f32 {
    let inner = short_side / 3.0;
    let outer = short_side;
    if outer <= inner {
        return 0.0;
    }
    ((distance - inner) / (outer - inner)).clamp(0.0, 1.0) * VIGNETTE_ALPHA
}

/// Darkens `area` towards black with a radial gradient centred on the area.
pub fn apply_vignette(img: &mut RgbImage, area: Rect) {
    let cx = area.x as f32 + area.width as f32 / 2.0;
    let cy = area.y as f32 + area.height as f32 / 2.0;
    let short_side = area.width.min(area.height) as f32;

    for y in area.y..area.bottom().min(img.height()) {
        for x in area.x..area.right().min(img.width()) {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let alpha = vignette_alpha((dx * dx + dy * dy).sqrt(), short_side);
            if alpha <= 0.0 {
                continue;
            }
            let pixel = img.get_pixel_mut(x, y);
            for c in 0..3 {
                pixel[c] = from_unit(to_unit(pixel[c]) * (1.0 - alpha));
            }
        }
    }
}

/// Applies the on-screen `contrast` then `sepia` filter inside `area`.
pub fn apply_print_tone(img: &mut RgbImage, area: Rect) {
    let keep = 1.0 - PRINT_SEPIA;
    let matrix = [
        [
            0.393 + 0.607 * keep,
            0.769 - 0.769 * keep,
            0.189 - 0.189 * keep,
        ],
        [
            0.349 - 0.349 * keep,
            0.686 + 0.314 * keep,
            0.168 - 0.168 * keep,
        ],
        [
            0.272 - 0.272 * keep,
            0.534 - 0.534 * keep,
            0.131 + 0.869 * keep,
        ],
    ];

    for y in area.y..area.bottom().min(img.height()) {
        for x in area.x..area.right().min(img.width()) {
            let pixel = img.get_pixel_mut(x, y);
            let contrasted = [0, 1, 2].map(|c| {
                ((to_unit(pixel[c]) - 0.5) * PRINT_CONTRAST + 0.5).clamp(0.0, 1.0)
            });
            for (c, row) in matrix.iter().enumerate() {
                let v = row[0] * contrasted[0] + row[1] * contrasted[1] + row[2] * contrasted[2];
                pixel[c] = from_unit(v);
            }
        }
    }
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode(img.as_raw(), img.width(), img.height(), ColorType::Rgb8)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_warm_overlay_warms_mid_gray() {
        let mut img = RgbImage::from_pixel(4, 4, Rgb([128, 128, 128]));
        apply_warm_overlay(&mut img);
        let p = img.get_pixel(2, 2);
        // Red stays warmer than blue after the tint.
        assert!(p[0] > p[2]);
        assert!(p[0] >= 128);
    }

    #[test]
    fn test_overlay_keeps_black_black() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        apply_warm_overlay(&mut img);
        assert_eq!(img.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_vignette_alpha_ramp() {
        assert_eq!(vignette_alpha(0.0, 300.0), 0.0);
        assert_eq!(vignette_alpha(100.0, 300.0), 0.0);
        assert!((vignette_alpha(200.0, 300.0) - 0.1).abs() < 1e-5);
        assert!((vignette_alpha(300.0, 300.0) - VIGNETTE_ALPHA).abs() < 1e-6);
        assert!((vignette_alpha(1000.0, 300.0) - VIGNETTE_ALPHA).abs() < 1e-6);
    }

    #[test]
    fn test_vignette_darkens_corners_only() {
        let mut img = RgbImage::from_pixel(90, 90, Rgb([200, 200, 200]));
        let area = Rect::full(&img);
        apply_vignette(&mut img, area);
        assert_eq!(img.get_pixel(45, 45), &Rgb([200, 200, 200]));

        let corner = img.get_pixel(0, 0)[0];
        assert!(corner < 200);
        assert!(corner >= 160, "corner darkened by more than 20%: {corner}");
    }

    #[test]
    fn test_vignette_respects_area() {
        let mut img = RgbImage::from_pixel(40, 40, Rgb([255, 255, 255]));
        apply_vignette(&mut img, Rect::new(10, 10, 20, 20));
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert!(img.get_pixel(10, 10)[0] < 255);
    }

    #[test]
    fn test_print_tone_sepia_shift() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([128, 128, 128]));
        let area = Rect::full(&img);
        apply_print_tone(&mut img, area);
        let p = img.get_pixel(0, 0);
        assert!(p[0] > p[1] && p[1] > p[2], "expected sepia ordering, got {p:?}");
    }

    #[test]
    fn test_encode_jpeg_decodes_to_same_size() {
        let img = RgbImage::from_pixel(33, 21, Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&img, JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (33, 21));
    }
}
