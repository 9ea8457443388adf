//! Licence-plate analyzer: detect, crop, read, annotate
//!
//! The detection model and the text reader are collaborators; this module
//! only owns the glue between them: padded crops, text cleanup, overlays
//! and per-box failure isolation.

use ab_glyph::{FontArc, PxScale};
use image::{imageops, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::analysis::FrameAnalyzer;
use crate::capture::Frame;
use crate::error::AnalysisError;

/// Pixels added around each detected box before reading text
pub const DEFAULT_PADDING: u32 = 10;

const LINE_WIDTH: u32 = 2;

const LABEL_SCALE: f32 = 14.0;
const LABEL_PADDING: u32 = 2;
const LABEL_TEXT: Rgb<u8> = Rgb([255, 255, 255]);

static LABEL_FONT: Lazy<Option<FontArc>> = Lazy::new(|| {
    match FontArc::try_from_slice(include_bytes!("../../assets/fonts/DejaVuSans.ttf")) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("Bundled label font failed to load, labels disabled: {}", e);
            None
        }
    }
});

const PALETTE: &[Rgb<u8>] = &[
    Rgb([255, 56, 56]),
    Rgb([255, 157, 151]),
    Rgb([255, 112, 31]),
    Rgb([255, 178, 29]),
    Rgb([207, 210, 49]),
    Rgb([72, 249, 10]),
    Rgb([26, 147, 52]),
    Rgb([0, 212, 187]),
    Rgb([44, 153, 168]),
    Rgb([0, 194, 255]),
];

/// One detected object in frame coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class_id: u32,
    pub class_name: String,
}

/// Object detection model
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, AnalysisError>;
}

/// Text recognition on a grayscale crop; returns text and confidence
pub trait TextReader: Send + Sync {
    fn read_text(&self, crop: &GrayImage) -> Result<(String, f32), AnalysisError>;
}

/// Keep only the characters a plate can carry
pub fn normalize_plate_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

pub struct PlateAnalyzer<D, R> {
    detector: D,
    reader: R,
    padding: u32,
    /// Labels are only logged when there is no font
    font: Option<FontArc>,
}

impl<D: Detector, R: TextReader> PlateAnalyzer<D, R> {
    pub fn new(detector: D, reader: R) -> Self {
        Self {
            detector,
            reader,
            padding: DEFAULT_PADDING,
            font: LABEL_FONT.clone(),
        }
    }

    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// Padded box clamped to the image, as (x, y, width, height)
    fn padded_region(&self, det: &Detection, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let pad = self.padding as i64;
        let x1 = (det.x1 as i64 - pad).max(0);
        let y1 = (det.y1 as i64 - pad).max(0);
        let x2 = (det.x2 as i64 + pad).min(width as i64);
        let y2 = (det.y2 as i64 + pad).min(height as i64);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }

    fn read_plate(&self, image: &RgbImage, region: (u32, u32, u32, u32)) -> (String, f32) {
        let (x, y, w, h) = region;
        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        let gray = imageops::grayscale(&crop);
        match self.reader.read_text(&gray) {
            Ok((text, confidence)) => (normalize_plate_text(&text), confidence),
            Err(e) => {
                warn!("Text reader failed: {}", e);
                (String::new(), 0.0)
            }
        }
    }
}

impl<D: Detector, R: TextReader> FrameAnalyzer for PlateAnalyzer<D, R> {
    fn analyze(&self, frame: Frame) -> Result<Frame, AnalysisError> {
        let mut canvas = frame
            .to_rgb_image()
            .ok_or_else(|| AnalysisError::Layout(format!("{:?}", frame.meta)))?;
        let (width, height) = canvas.dimensions();

        let detections = self.detector.detect(&canvas)?;
        debug!(frame = frame.sequence(), count = detections.len(), "Detections");

        let source = canvas.clone();
        for det in &detections {
            let Some(region) = self.padded_region(det, width, height) else {
                continue;
            };
            let (text, confidence) = self.read_plate(&source, region);
            let label = format!("{} - {} - {:.2}", det.class_name, text, confidence);
            info!(frame = frame.sequence(), "{}", label);

            let color = PALETTE[det.class_id as usize % PALETTE.len()];
            draw_box(&mut canvas, det, color);
            if let Some(font) = &self.font {
                draw_label(&mut canvas, det, &label, color, font);
            }
        }

        Ok(frame.with_image(canvas))
    }
}

fn draw_box(canvas: &mut RgbImage, det: &Detection, color: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    let x1 = (det.x1.max(0.0) as u32).min(width.saturating_sub(1));
    let y1 = (det.y1.max(0.0) as u32).min(height.saturating_sub(1));
    let x2 = (det.x2.max(0.0) as u32).min(width);
    let y2 = (det.y2.max(0.0) as u32).min(height);

    for inset in 0..LINE_WIDTH {
        let w = x2.saturating_sub(x1).saturating_sub(2 * inset);
        let h = y2.saturating_sub(y1).saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((x1 + inset) as i32, (y1 + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

/// Filled strip with the label text, above the box or below it when the
/// box is too close to the top edge
fn draw_label(canvas: &mut RgbImage, det: &Detection, label: &str, color: Rgb<u8>, font: &FontArc) {
    let (width, height) = canvas.dimensions();
    let scale = PxScale::from(LABEL_SCALE);
    let (text_width, text_height) = text_size(scale, font, label);
    let strip_width = text_width + 2 * LABEL_PADDING;
    let strip_height = text_height + 2 * LABEL_PADDING;

    let x = (det.x1.max(0.0) as u32).min(width.saturating_sub(1));
    let y1 = det.y1.max(0.0) as u32;
    let y2 = (det.y2.max(0.0) as u32).min(height);
    let top = if y1 >= strip_height { y1 - strip_height } else { y2 };
    if top >= height {
        return;
    }

    let strip = Rect::at(x as i32, top as i32).of_size(strip_width, strip_height);
    draw_filled_rect_mut(canvas, strip, color);
    draw_text_mut(
        canvas,
        LABEL_TEXT,
        (x + LABEL_PADDING) as i32,
        (top + LABEL_PADDING) as i32,
        scale,
        font,
        label,
    );
}
