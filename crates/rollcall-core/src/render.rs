//! Annotation renderer. Draws face boxes and identity tags onto a copy of the photo.

use crate::font;
use crate::types::{BoundingBox, MatchResult};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use thiserror::Error;

pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNMATCHED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
/// Dark text on the green tag.
const MATCHED_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
/// Light text on the red tag.
const UNMATCHED_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
/// Padding between the tag edge and its text.
const TAG_PADDING: u32 = 3;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// JPEG quality, 1–100.
    pub jpeg_quality: u8,
    /// Box outline thickness in pixels.
    pub stroke: u32,
    /// Integer scale applied to the 5×7 label font.
    pub text_scale: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            stroke: 3,
            text_scale: 2,
        }
    }
}

/// Draws match outcomes onto photographs.
#[derive(Debug, Clone, Default)]
pub struct AnnotationRenderer {
    options: RenderOptions,
}

impl AnnotationRenderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Draw every result onto a fresh RGB copy of `image`, in detection order.
    pub fn annotate(&self, image: &DynamicImage, results: &[MatchResult]) -> RgbImage {
        let mut canvas = image.to_rgb8();
        for result in results {
            let bbox = &result.observation.bounding_box;
            if bbox.left >= canvas.width() || bbox.top >= canvas.height() {
                tracing::debug!(?bbox, "face box lies outside the image; skipped");
                continue;
            }
            let (box_color, text_color) = if result.is_matched() {
                (MATCHED_COLOR, MATCHED_TEXT_COLOR)
            } else {
                (UNMATCHED_COLOR, UNMATCHED_TEXT_COLOR)
            };
            draw_box(&mut canvas, bbox, self.options.stroke, box_color);
            self.draw_tag(&mut canvas, bbox, result.label(), box_color, text_color);
        }
        canvas
    }

    /// Annotate and JPEG-encode. The input image is left untouched.
    pub fn render(
        &self,
        image: &DynamicImage,
        results: &[MatchResult],
    ) -> Result<Vec<u8>, RenderError> {
        let canvas = self.annotate(image, results);
        let mut buf = Vec::new();
        let quality = self.options.jpeg_quality.clamp(1, 100);
        canvas.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
        Ok(buf)
    }

    /// Filled label tag just beneath the box, shifted to stay inside the image.
    fn draw_tag(
        &self,
        canvas: &mut RgbImage,
        bbox: &BoundingBox,
        label: &str,
        fill: Rgb<u8>,
        text_color: Rgb<u8>,
    ) {
        let scale = self.options.text_scale.max(1);
        let tag_w = (font::text_width(label, scale) + 2 * TAG_PADDING) as i64;
        let tag_h = (font::text_height(scale) + 2 * TAG_PADDING) as i64;
        let (w, h) = (canvas.width() as i64, canvas.height() as i64);

        let x = (bbox.left as i64).min(w - tag_w).max(0);
        let y = (bbox.bottom as i64 + 1).min(h - tag_h).max(0);

        fill_rect(canvas, x, y, x + tag_w, y + tag_h, fill);
        font::draw_text(
            canvas,
            x + TAG_PADDING as i64,
            y + TAG_PADDING as i64,
            label,
            scale,
            text_color,
        );
    }
}

/// Outline `bbox` (edges inclusive) with a band `stroke` pixels thick, drawn inward.
fn draw_box(canvas: &mut RgbImage, bbox: &BoundingBox, stroke: u32, color: Rgb<u8>) {
    let (x0, y0) = (bbox.left as i64, bbox.top as i64);
    let (x1, y1) = (bbox.right as i64 + 1, bbox.bottom as i64 + 1);
    let s = stroke.max(1) as i64;

    fill_rect(canvas, x0, y0, x1, (y0 + s).min(y1), color);
    fill_rect(canvas, x0, (y1 - s).max(y0), x1, y1, color);
    fill_rect(canvas, x0, y0, (x0 + s).min(x1), y1, color);
    fill_rect(canvas, (x1 - s).max(x0), y0, x1, y1, color);
}

/// Fill the half-open rectangle `[x0, x1) × [y0, y1)`, clipped to the canvas.
fn fill_rect(canvas: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    let (w, h) = (canvas.width() as i64, canvas.height() as i64);
    let (x0, x1) = (x0.clamp(0, w), x1.clamp(0, w));
    let (y0, y1) = (y0.clamp(0, h), y1.clamp(0, h));
    for y in y0..y1 {
        for x in x0..x1 {
            canvas.put_pixel(x as u32, y as u32, color);
        }
    }
}
