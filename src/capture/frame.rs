use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Decoded frame with zero-copy semantics
///
/// Cloning is cheap (reference counted); a frame is never mutated once
/// produced. Analyzers that annotate it produce a new `Frame`.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data, `stride * height` bytes
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Acquisition timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Position in capture order, starting at 1 for the whole run
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }
}

/// Stream properties discovered once per successful connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamDescriptor {
    pub width: u32,
    pub height: u32,
    /// Nominal frames per second
    pub fps: f64,
    /// Known length of a finite source; `None` for live or unbounded sources
    pub total_frames: Option<u64>,
}

impl StreamDescriptor {
    pub fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// A zero dimension means the source has not reported its format yet
    pub fn has_frame_size(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Whether `frame_count` frames exhaust a finite source
    pub fn is_exhausted(&self, frame_count: u64) -> bool {
        matches!(self.total_frames, Some(total) if frame_count >= total)
    }
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, meta: FrameMetadata) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    /// Wrap an RGB image, keeping the capture sequence number
    pub fn from_rgb_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(
            image.into_raw(),
            FrameMetadata {
                sequence,
                width,
                height,
                stride: width * PixelFormat::Rgb24.bytes_per_pixel(),
                format: PixelFormat::Rgb24,
            },
        )
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }

    /// Copy the pixels out as a tightly packed RGB image.
    ///
    /// Returns `None` when the buffer is shorter than the metadata claims.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let FrameMetadata {
            width,
            height,
            stride,
            format,
            ..
        } = *self.meta;
        let row_len = (width * format.bytes_per_pixel()) as usize;
        let stride = stride as usize;
        if stride < row_len || self.data.len() < stride * height as usize {
            return None;
        }

        let mut packed = Vec::with_capacity(row_len * height as usize);
        for row in self.data.chunks(stride).take(height as usize) {
            let row = &row[..row_len];
            match format {
                PixelFormat::Rgb24 => packed.extend_from_slice(row),
                PixelFormat::Bgr24 => {
                    for px in row.chunks_exact(3) {
                        packed.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                }
            }
        }
        RgbImage::from_raw(width, height, packed)
    }

    /// Same frame with new pixel data, e.g. after drawing overlays
    pub fn with_image(&self, image: RgbImage) -> Self {
        let mut frame = Self::from_rgb_image(image, self.meta.sequence);
        frame.timestamp = self.timestamp;
        frame
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_frames_convert_to_rgb() {
        let frame = Frame::new(
            vec![1u8, 2, 3, 4, 5, 6],
            FrameMetadata {
                sequence: 7,
                width: 2,
                height: 1,
                stride: 6,
                format: PixelFormat::Bgr24,
            },
        );
        let image = frame.to_rgb_image().unwrap();
        assert_eq!(image.into_raw(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn padded_rows_are_packed() {
        let frame = Frame::new(
            vec![9u8, 9, 9, 0, 8, 8, 8, 0],
            FrameMetadata {
                sequence: 1,
                width: 1,
                height: 2,
                stride: 4,
                format: PixelFormat::Rgb24,
            },
        );
        assert_eq!(frame.to_rgb_image().unwrap().into_raw(), vec![9, 9, 9, 8, 8, 8]);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let frame = Frame::new(
            vec![0u8; 5],
            FrameMetadata {
                sequence: 1,
                width: 2,
                height: 1,
                stride: 6,
                format: PixelFormat::Rgb24,
            },
        );
        assert!(frame.to_rgb_image().is_none());
    }

    #[test]
    fn exhaustion_needs_a_known_total() {
        let live = StreamDescriptor {
            width: 4,
            height: 4,
            fps: 25.0,
            total_frames: None,
        };
        assert!(!live.is_exhausted(u64::MAX));

        let file = StreamDescriptor {
            total_frames: Some(3),
            ..live
        };
        assert!(!file.is_exhausted(2));
        assert!(file.is_exhausted(3));
    }

    #[test]
    fn unnegotiated_size_is_detected() {
        let pending = StreamDescriptor {
            width: 0,
            height: 0,
            fps: 30.0,
            total_frames: None,
        };
        assert!(!pending.has_frame_size());
        assert!(StreamDescriptor { width: 640, height: 480, ..pending }.has_frame_size());
    }

    #[test]
    fn with_image_keeps_sequence() {
        let frame = Frame::from_rgb_image(RgbImage::new(2, 2), 42);
        let redrawn = frame.with_image(RgbImage::new(2, 2));
        assert_eq!(redrawn.sequence(), 42);
        assert_eq!(redrawn.dimensions(), (2, 2));
    }
}
