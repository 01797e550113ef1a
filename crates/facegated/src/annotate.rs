//! On-frame boxes and labels.

use ab_glyph::{FontVec, PxScale};
use facegate_core::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

/// Good capture or recognised identity.
pub const GOOD: Rgb<u8> = Rgb([0, 255, 0]);
/// Rejected capture or unknown face.
pub const BAD: Rgb<u8> = Rgb([255, 0, 0]);
/// Recognised identity without a user record.
pub const UNRECORDED: Rgb<u8> = Rgb([255, 165, 0]);
pub const TEXT: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 20.0;
const GUIDANCE_ORIGIN: (i32, i32) = (50, 30);
const GUIDANCE_LINE_HEIGHT: i32 = 50;

/// A box to draw, with an optional caption above it.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    pub face: BoundingBox,
    pub color: Rgb<u8>,
    pub caption: Option<String>,
}

/// Draws marks and guidance text. Text is skipped when no font is loaded.
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn without_text() -> Self {
        Self { font: None }
    }

    /// Load a TrueType font for captions. A missing or invalid font is
    /// logged and leaves the annotator box-only.
    pub fn load(font_path: Option<&Path>) -> Self {
        let Some(path) = font_path else {
            return Self::without_text();
        };
        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => {
                tracing::info!(path = %path.display(), "label font loaded");
                Self { font: Some(font) }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "label font unavailable; drawing boxes only");
                Self::without_text()
            }
        }
    }

    pub fn draw_mark(&self, frame: &mut RgbImage, mark: &Mark) {
        let Some((x, y, w, h)) = mark.face.clamp_to(frame.width(), frame.height()) else {
            return;
        };
        for inset in 0..BOX_THICKNESS {
            let (iw, ih) = (w as i32 - 2 * inset, h as i32 - 2 * inset);
            if iw <= 0 || ih <= 0 {
                break;
            }
            let rect = Rect::at(x as i32 + inset, y as i32 + inset).of_size(iw as u32, ih as u32);
            draw_hollow_rect_mut(frame, rect, mark.color);
        }

        if let (Some(font), Some(caption)) = (&self.font, &mark.caption) {
            let text_y = (y as i32 - LABEL_SCALE as i32 - 4).max(0);
            draw_text_mut(frame, TEXT, x as i32, text_y, PxScale::from(LABEL_SCALE), font, caption);
        }
    }

    /// Guidance text in the top-left corner, one entry per line.
    pub fn draw_guidance(&self, frame: &mut RgbImage, lines: &[&str]) {
        let Some(font) = &self.font else {
            return;
        };
        let (x, mut y) = GUIDANCE_ORIGIN;
        for line in lines {
            draw_text_mut(frame, TEXT, x, y, PxScale::from(LABEL_SCALE * 1.5), font, line);
            y += GUIDANCE_LINE_HEIGHT;
        }
    }
}
