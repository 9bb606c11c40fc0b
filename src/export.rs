// High-resolution rendering of a committed print card.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use rusttype::{Font, Scale};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::MAX_EXPORT_SCALE;
use crate::entry::PrintEntry;
use crate::errors::ExportError;
use crate::vintage::{self, Rect};

// Card geometry at 1x, matching the on-screen print
const CARD_WIDTH: u32 = 256;
const CARD_HEIGHT: u32 = 320;
const INSET_SIDE: u32 = 12;
const INSET_TOP: u32 = 12;
const INSET_BOTTOM: u32 = 64;

const CAPTION_MARGIN: u32 = 16;
const CAPTION_SIZE: f32 = 20.0;
const TIMESTAMP_MARGIN: u32 = 4;
const TIMESTAMP_SIZE: f32 = 14.0;

const CARD_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BACKDROP_COLOR: Rgb<u8> = Rgb([17, 24, 39]);
const CAPTION_COLOR: Rgb<u8> = Rgb([31, 41, 55]);
const TIMESTAMP_COLOR: Rgb<u8> = Rgb([107, 114, 128]);

pub const DEFAULT_EXPORT_SCALE: u32 = 4;

/// Download name for an exported entry.
pub fn export_filename(id: &str) -> String {
    format!("retro-cam-{}.jpg", id)
}

/// Pixel layout of the card at a given scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardLayout {
    pub width: u32,
    pub height: u32,
    pub image_area: Rect,
    pub caption_y: u32,
    pub caption_scale: f32,
    pub timestamp_gap: u32,
    pub timestamp_scale: f32,
}

impl CardLayout {
    pub fn at_scale(scale: u32) -> Result<Self, ExportError> {
        if scale == 0 || scale > MAX_EXPORT_SCALE {
            return Err(ExportError::InvalidDimensions(format!(
                "scale must be between 1 and {}, got {}",
                MAX_EXPORT_SCALE, scale
            )));
        }

        let width = CARD_WIDTH * scale;
        let height = CARD_HEIGHT * scale;
        let image_area = Rect::new(
            INSET_SIDE * scale,
            INSET_TOP * scale,
            width - 2 * INSET_SIDE * scale,
            height - (INSET_TOP + INSET_BOTTOM) * scale,
        );

        Ok(Self {
            width,
            height,
            image_area,
            caption_y: image_area.bottom() + CAPTION_MARGIN * scale,
            caption_scale: CAPTION_SIZE * scale as f32,
            timestamp_gap: TIMESTAMP_MARGIN * scale,
            timestamp_scale: TIMESTAMP_SIZE * scale as f32,
        })
    }
}

/// Source region that covers a `dst_w x dst_h` box without distortion,
/// centred on the source.
pub fn cover_crop(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Rect {
    let scale = (dst_w as f64 / src_w as f64).max(dst_h as f64 / src_h as f64);
    let crop_w = ((dst_w as f64 / scale).round() as u32).clamp(1, src_w);
    let crop_h = ((dst_h as f64 / scale).round() as u32).clamp(1, src_h);
    Rect::new((src_w - crop_w) / 2, (src_h - crop_h) / 2, crop_w, crop_h)
}

pub struct ExportRenderer {
    font: Option<Font<'static>>,
    placeholder: String,
}

impl ExportRenderer {
    /// Loads the caption font. A missing or unreadable font renders cards without text.
    pub fn new(font_path: Option<&Path>, placeholder: impl Into<String>) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(data) => {
                let font = Font::try_from_vec(data);
                if font.is_none() {
                    warn!("Failed to parse font {:?}. Exports will have no text.", path);
                }
                font
            }
            Err(e) => {
                warn!("Font {:?} not found ({}). Exports will have no text.", path, e);
                None
            }
        });

        Self {
            font,
            placeholder: placeholder.into(),
        }
    }

    pub fn without_font(placeholder: impl Into<String>) -> Self {
        Self {
            font: None,
            placeholder: placeholder.into(),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Renders the entry as a JPEG card.
    pub fn render(&self, entry: &PrintEntry, scale: u32) -> Result<Vec<u8>, ExportError> {
        let card = self.compose(entry, scale)?;
        debug!(
            "Rendered export for {} at {}x{}",
            entry.id(),
            card.width(),
            card.height()
        );
        vintage::encode_jpeg(&card, vintage::JPEG_QUALITY)
            .map_err(|e| ExportError::EncodeFailed(e.to_string()))
    }

    pub fn compose(&self, entry: &PrintEntry, scale: u32) -> Result<RgbImage, ExportError> {
        let layout = CardLayout::at_scale(scale)?;
        let photo = image::load_from_memory(entry.image_data())
            .map_err(|e| ExportError::ImageLoadError(e.to_string()))?
            .to_rgb8();
        if photo.width() == 0 || photo.height() == 0 {
            return Err(ExportError::InvalidDimensions(
                "stored image has no pixels".to_string(),
            ));
        }

        let mut canvas = ImageBuffer::from_pixel(layout.width, layout.height, CARD_COLOR);
        let area = layout.image_area;

        // Backdrop shows through only if the photo fails to cover the area
        for y in area.y..area.bottom() {
            for x in area.x..area.right() {
                canvas.put_pixel(x, y, BACKDROP_COLOR);
            }
        }

        let crop = cover_crop(photo.width(), photo.height(), area.width, area.height);
        let region = imageops::crop_imm(&photo, crop.x, crop.y, crop.width, crop.height).to_image();
        let placed = imageops::resize(&region, area.width, area.height, FilterType::Lanczos3);
        imageops::replace(&mut canvas, &placed, area.x as i64, area.y as i64);

        vintage::apply_print_tone(&mut canvas, area);
        vintage::apply_vignette(&mut canvas, area);

        self.add_caption_text(&mut canvas, &layout, entry);
        Ok(canvas)
    }

    fn add_caption_text(&self, canvas: &mut RgbImage, layout: &CardLayout, entry: &PrintEntry) {
        let Some(font) = &self.font else {
            return;
        };

        let caption_scale = Scale::uniform(layout.caption_scale);
        let max_width = layout.image_area.width;
        let caption = entry.caption().text(&self.placeholder);

        let mut y = layout.caption_y;
        for line in wrap_text(font, caption, caption_scale, max_width) {
            self.draw_centered(canvas, font, &line, caption_scale, y, CAPTION_COLOR);
            y += layout.caption_scale.ceil() as u32;
        }

        let timestamp_scale = Scale::uniform(layout.timestamp_scale);
        let timestamp_y = y + layout.timestamp_gap;
        self.draw_centered(
            canvas,
            font,
            entry.captured_at(),
            timestamp_scale,
            timestamp_y,
            TIMESTAMP_COLOR,
        );
    }

    fn draw_centered(
        &self,
        canvas: &mut RgbImage,
        font: &Font<'static>,
        text: &str,
        scale: Scale,
        y: u32,
        color: Rgb<u8>,
    ) {
        // Skip lines that would start past the card edge
        if y >= canvas.height() {
            return;
        }
        let width = measure_text_width(font, text, scale).min(canvas.width());
        draw_text_mut(
            canvas,
            color,
            ((canvas.width() - width) / 2) as i32,
            y as i32,
            scale,
            font,
            text,
        );
    }
}

fn measure_text_width(font: &Font, text: &str, scale: Scale) -> u32 {
    font.layout(text, scale, rusttype::point(0.0, 0.0))
        .last()
        .and_then(|g| g.pixel_bounding_box())
        .map_or(0, |bb| bb.max.x.max(0) as u32)
}

fn wrap_text(font: &Font, text: &str, scale: Scale, max_width: u32) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in text.split_whitespace() {
        let test_line = if current_line.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", current_line, word)
        };

        if measure_text_width(font, &test_line, scale) > max_width && !current_line.is_empty() {
            lines.push(std::mem::replace(&mut current_line, word.to_string()));
        } else {
            current_line = test_line;
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn entry_with(img: &RgbImage) -> PrintEntry {
        let jpeg = vintage::encode_jpeg(img, 90).unwrap();
        let captured = Local.with_ymd_and_hms(2026, 10, 18, 14, 30, 0).unwrap();
        PrintEntry::new("abc", jpeg, captured, 0.0)
    }

    #[test]
    fn test_layout_at_default_scale() {
        let layout = CardLayout::at_scale(DEFAULT_EXPORT_SCALE).unwrap();
        assert_eq!((layout.width, layout.height), (1024, 1280));
        assert_eq!(layout.image_area, Rect::new(48, 48, 928, 976));
        assert_eq!(layout.caption_y, 48 + 976 + 64);
        assert_eq!(layout.caption_scale, 80.0);
        assert_eq!(layout.timestamp_scale, 56.0);
    }

    #[test]
    fn test_invalid_scale() {
        assert!(matches!(
            CardLayout::at_scale(0),
            Err(ExportError::InvalidDimensions(_))
        ));
        assert!(CardLayout::at_scale(MAX_EXPORT_SCALE + 1).is_err());
        assert!(CardLayout::at_scale(1).is_ok());
    }

    #[test]
    fn test_cover_crop_landscape_fills_height() {
        let crop = cover_crop(1920, 1080, 928, 976);
        assert_eq!(crop.height, 1080);
        assert_eq!(crop.y, 0);
        assert!(crop.width < 1920);
        // Centred horizontally
        let left = crop.x;
        let right = 1920 - crop.right();
        assert!(left.abs_diff(right) <= 1);
    }

    #[test]
    fn test_cover_crop_square_into_portrait() {
        let crop = cover_crop(1080, 1080, 928, 976);
        assert_eq!(crop.height, 1080);
        assert_eq!(crop.y, 0);
        assert_eq!(crop.width, 1027);
        assert_eq!(crop.x, 26);
    }

    #[test]
    fn test_export_dimensions_and_border() {
        let source = ImageBuffer::from_pixel(192, 108, Rgb([200u8, 30, 30]));
        let renderer = ExportRenderer::without_font("developing…");
        let card = renderer.compose(&entry_with(&source), 4).unwrap();

        assert_eq!(card.dimensions(), (1024, 1280));
        assert_eq!(card.get_pixel(4, 4), &CARD_COLOR);
        assert_eq!(card.get_pixel(512, 1200), &CARD_COLOR);

        // Photo covers the area: red dominates at the centre
        let centre = card.get_pixel(48 + 464, 48 + 488);
        assert!(centre[0] > centre[2] + 60);

        let jpeg = renderer.render(&entry_with(&source), 4).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1024, 1280));
    }

    #[test]
    fn test_export_is_idempotent() {
        let source = ImageBuffer::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 90]));
        let entry = entry_with(&source);
        let renderer = ExportRenderer::without_font("developing…");
        assert_eq!(
            renderer.render(&entry, 1).unwrap(),
            renderer.render(&entry, 1).unwrap()
        );
    }

    #[test]
    fn test_undecodable_image_is_recoverable() {
        let captured = Local.with_ymd_and_hms(2026, 10, 18, 14, 30, 0).unwrap();
        let entry = PrintEntry::new("bad", vec![1, 2, 3, 4], captured, 0.0);
        let renderer = ExportRenderer::without_font("developing…");
        assert!(matches!(
            renderer.render(&entry, 4),
            Err(ExportError::ImageLoadError(_))
        ));
    }

    #[test]
    fn test_missing_font_is_tolerated() {
        let renderer = ExportRenderer::new(Some(Path::new("/nonexistent/font.ttf")), "developing…");
        assert!(!renderer.has_font());
    }

    #[test]
    fn test_filename() {
        assert_eq!(export_filename("abc-123"), "retro-cam-abc-123.jpg");
    }
}
