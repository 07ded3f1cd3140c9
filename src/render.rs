use ab_glyph::{Font, FontVec, PxScale, ScaleFont, point};
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};

const BADGE_COLOR: Rgb<u8> = Rgb([0x00, 0x4A, 0xAD]);
const TEXT_COLOR: Rgb<u8> = Rgb([0xFF, 0xFF, 0xFF]);
const EDGE_MARGIN: i64 = 20;
const BADGE_PADDING: i64 = 10;
const MIN_FONT_PX: f32 = 14.0;
const FONT_RATIO: f32 = 0.045;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("source image could not be decoded: {0}")]
    Decode(#[source] image::ImageError),
    #[error("rendered image could not be encoded: {0}")]
    Encode(#[source] image::ImageError),
    #[error("font unavailable: {0}")]
    Font(String),
    #[error("invalid price {0:?}")]
    Price(String),
    #[error("render task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Default)]
pub struct RenderConfig {
    pub font_path: Option<PathBuf>,
    pub canvas: Option<(u32, u32)>,
    pub jpeg_quality: u8,
}

enum Typeface {
    Builtin,
    TrueType(FontVec),
    Missing(String),
}

/// Stamps the `"<price> DH"` badge onto variant images.
#[derive(Clone)]
pub struct ArtifactRenderer {
    typeface: Arc<Typeface>,
    canvas: Option<(u32, u32)>,
    jpeg_quality: u8,
}

impl ArtifactRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        let typeface = match &config.font_path {
            None => Typeface::Builtin,
            Some(path) => match std::fs::read(path)
                .map_err(|err| err.to_string())
                .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|err| err.to_string()))
            {
                Ok(font) => {
                    info!(target = "vsync.render", path = %path.display(), "font_loaded");
                    Typeface::TrueType(font)
                }
                Err(err) => {
                    let reason = format!("{}: {err}", path.display());
                    warn!(target = "vsync.render", reason = %reason, "font_unavailable");
                    Typeface::Missing(reason)
                }
            },
        };
        Self {
            typeface: Arc::new(typeface),
            canvas: config.canvas,
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        }
    }

    /// Renders on the blocking pool; decoding and encoding are CPU bound.
    pub async fn render(&self, source: Vec<u8>, price: String) -> Result<Vec<u8>, RenderError> {
        let renderer = self.clone();
        tokio::task::spawn_blocking(move || renderer.render_blocking(&source, &price))
            .await
            .map_err(|err| RenderError::Join(err.to_string()))?
    }

    pub fn render_blocking(&self, source: &[u8], price: &str) -> Result<Vec<u8>, RenderError> {
        let text = badge_text(price)?;
        let decoded = image::load_from_memory(source).map_err(RenderError::Decode)?;
        let mut canvas = decoded.to_rgb8();
        if let Some((width, height)) = self.canvas {
            canvas = image::imageops::resize(&canvas, width, height, FilterType::Lanczos3);
        }

        let font_px = font_px_for(canvas.width(), canvas.height());
        let (text_w, text_h) = self.measure(&text, font_px)?;
        let x = canvas.width() as i64 - text_w - EDGE_MARGIN;
        let y = canvas.height() as i64 - text_h - EDGE_MARGIN;
        fill_rect(
            &mut canvas,
            x - BADGE_PADDING,
            y - BADGE_PADDING,
            x + text_w + BADGE_PADDING,
            y + text_h + BADGE_PADDING,
            BADGE_COLOR,
        );
        self.draw_text(&mut canvas, &text, font_px, x, y)?;

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
            .encode_image(&canvas)
            .map_err(RenderError::Encode)?;
        Ok(out)
    }

    fn measure(&self, text: &str, font_px: f32) -> Result<(i64, i64), RenderError> {
        match self.typeface.as_ref() {
            Typeface::Builtin => Ok(builtin::measure(text, font_px)),
            Typeface::TrueType(font) => Ok(truetype_bounds(font, text, font_px)
                .map(|(min_x, min_y, max_x, max_y)| {
                    ((max_x - min_x).ceil() as i64, (max_y - min_y).ceil() as i64)
                })
                .unwrap_or((0, 0))),
            Typeface::Missing(reason) => Err(RenderError::Font(reason.clone())),
        }
    }

    fn draw_text(
        &self,
        canvas: &mut RgbImage,
        text: &str,
        font_px: f32,
        x: i64,
        y: i64,
    ) -> Result<(), RenderError> {
        match self.typeface.as_ref() {
            Typeface::Builtin => {
                builtin::draw(canvas, text, font_px, x, y, TEXT_COLOR);
                Ok(())
            }
            Typeface::TrueType(font) => {
                draw_truetype(canvas, font, text, font_px, x, y, TEXT_COLOR);
                Ok(())
            }
            Typeface::Missing(reason) => Err(RenderError::Font(reason.clone())),
        }
    }
}

/// `"129.00"` → `"129 DH"`; fractional units are truncated toward zero.
pub fn badge_text(price: &str) -> Result<String, RenderError> {
    let value: f64 = price
        .trim()
        .parse()
        .map_err(|_| RenderError::Price(price.to_string()))?;
    if !value.is_finite() {
        return Err(RenderError::Price(price.to_string()));
    }
    Ok(format!("{} DH", value.trunc() as i64))
}

pub fn font_px_for(width: u32, height: u32) -> f32 {
    (width.min(height) as f32 * FONT_RATIO).max(MIN_FONT_PX)
}

fn fill_rect(canvas: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    let max_x = canvas.width() as i64 - 1;
    let max_y = canvas.height() as i64 - 1;
    for py in y0.max(0)..=y1.min(max_y) {
        for px in x0.max(0)..=x1.min(max_x) {
            canvas.put_pixel(px as u32, py as u32, color);
        }
    }
}

fn blend(canvas: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>, coverage: f32) {
    if x < 0 || y < 0 || x >= canvas.width() as i64 || y >= canvas.height() as i64 {
        return;
    }
    let coverage = coverage.clamp(0.0, 1.0);
    let pixel = canvas.get_pixel_mut(x as u32, y as u32);
    for (channel, target) in pixel.0.iter_mut().zip(color.0) {
        *channel = (*channel as f32 * (1.0 - coverage) + target as f32 * coverage).round() as u8;
    }
}

fn layout_glyphs(font: &FontVec, text: &str, font_px: f32) -> Vec<ab_glyph::Glyph> {
    let scaled = font.as_scaled(PxScale::from(font_px));
    let mut caret = 0.0;
    let mut previous = None;
    let mut glyphs = Vec::with_capacity(text.len());
    for c in text.chars() {
        let mut glyph = scaled.scaled_glyph(c);
        if let Some(prev) = previous {
            caret += scaled.kern(prev, glyph.id);
        }
        glyph.position = point(caret, scaled.ascent());
        caret += scaled.h_advance(glyph.id);
        previous = Some(glyph.id);
        glyphs.push(glyph);
    }
    glyphs
}

// Ink bounds of the laid-out text, relative to the layout origin.
fn truetype_bounds(font: &FontVec, text: &str, font_px: f32) -> Option<(f32, f32, f32, f32)> {
    layout_glyphs(font, text, font_px)
        .into_iter()
        .filter_map(|glyph| font.outline_glyph(glyph))
        .map(|outlined| outlined.px_bounds())
        .fold(None, |acc, b| {
            Some(match acc {
                None => (b.min.x, b.min.y, b.max.x, b.max.y),
                Some((x0, y0, x1, y1)) => {
                    (x0.min(b.min.x), y0.min(b.min.y), x1.max(b.max.x), y1.max(b.max.y))
                }
            })
        })
}

fn draw_truetype(
    canvas: &mut RgbImage,
    font: &FontVec,
    text: &str,
    font_px: f32,
    x: i64,
    y: i64,
    color: Rgb<u8>,
) {
    let Some((min_x, min_y, _, _)) = truetype_bounds(font, text, font_px) else {
        return;
    };
    // Shift so the ink box starts exactly at (x, y).
    let offset_x = x - min_x.floor() as i64;
    let offset_y = y - min_y.floor() as i64;
    for glyph in layout_glyphs(font, text, font_px) {
        if let Some(outlined) = font.outline_glyph(glyph) {
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, coverage| {
                blend(
                    canvas,
                    offset_x + bounds.min.x as i64 + gx as i64,
                    offset_y + bounds.min.y as i64 + gy as i64,
                    color,
                    coverage,
                );
            });
        }
    }
}

/// 5x7 bitmap face covering everything a badge can contain.
mod builtin {
    use super::*;

    const CELL_W: i64 = 5;
    const CELL_H: i64 = 7;
    const ADVANCE: i64 = CELL_W + 1;

    fn rows(c: char) -> [u8; 7] {
        match c {
            '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
            '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
            '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
            '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
            '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
            '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
            '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
            '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
            '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
            '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
            'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
            'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
            '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
            _ => [0x00; 7],
        }
    }

    fn scale(font_px: f32) -> i64 {
        ((font_px / CELL_H as f32).round() as i64).max(1)
    }

    pub(super) fn measure(text: &str, font_px: f32) -> (i64, i64) {
        let glyphs = text.chars().count() as i64;
        if glyphs == 0 {
            return (0, 0);
        }
        let scale = scale(font_px);
        ((glyphs * ADVANCE - 1) * scale, CELL_H * scale)
    }

    pub(super) fn draw(
        canvas: &mut RgbImage,
        text: &str,
        font_px: f32,
        x: i64,
        y: i64,
        color: Rgb<u8>,
    ) {
        let scale = scale(font_px);
        for (index, c) in text.chars().enumerate() {
            let origin_x = x + index as i64 * ADVANCE * scale;
            for (row, bits) in rows(c).iter().enumerate() {
                for col in 0..CELL_W {
                    if bits & (1 << (CELL_W - 1 - col)) == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            blend(
                                canvas,
                                origin_x + col * scale + dx,
                                y + row as i64 * scale + dy,
                                color,
                                1.0,
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img: RgbImage = image::ImageBuffer::from_pixel(width, height, Rgb(color));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}
