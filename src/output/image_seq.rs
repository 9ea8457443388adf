//! Sink writing one PNG per frame into a directory

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use image::ImageFormat;
use tracing::{debug, info};

use crate::capture::Frame;
use crate::error::SinkError;
use crate::output::FrameSink;

/// Writes `frame_000001.png`, `frame_000002.png`, ... under the output path.
///
/// File indices follow write order, not capture order. Encoding happens
/// outside the lock so workers encode in parallel; only the file write is
/// serialized, and a frame counts once its file is on disk.
#[derive(Default)]
pub struct ImageSequenceSink {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    dir: Option<PathBuf>,
    frame_size: (u32, u32),
    written: u64,
    released: bool,
}

impl ImageSequenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_written(&self) -> u64 {
        self.lock().written
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for ImageSequenceSink {
    fn init(&self, output_path: &Path, fps: f64, frame_size: (u32, u32)) -> Result<(), SinkError> {
        let mut inner = self.lock();
        if inner.dir.as_deref() == Some(output_path) && !inner.released {
            debug!("Continuing image sequence at {}", output_path.display());
            inner.frame_size = frame_size;
            return Ok(());
        }

        fs::create_dir_all(output_path).map_err(|e| SinkError::Init {
            path: output_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!(
            "Writing image sequence to {} ({}x{} @ {:.2} fps)",
            output_path.display(),
            frame_size.0,
            frame_size.1,
            fps
        );
        *inner = Inner {
            dir: Some(output_path.to_path_buf()),
            frame_size,
            written: 0,
            released: false,
        };
        Ok(())
    }

    fn write(&self, frame: &Frame) -> Result<(), SinkError> {
        let write_err = |reason: String| SinkError::Write {
            sequence: frame.sequence(),
            reason,
        };
        let image = frame
            .to_rgb_image()
            .ok_or_else(|| write_err("malformed pixel buffer".into()))?;
        let mut encoded = Cursor::new(Vec::new());
        image.write_to(&mut encoded, ImageFormat::Png)?;

        let mut inner = self.lock();
        let dir = match (&inner.dir, inner.released) {
            (Some(dir), false) => dir.clone(),
            _ => return Err(SinkError::NotInitialized),
        };
        if frame.dimensions() != inner.frame_size {
            return Err(write_err(format!(
                "frame is {:?}, recording is {:?}",
                frame.dimensions(),
                inner.frame_size
            )));
        }
        let index = inner.written + 1;
        fs::write(dir.join(format!("frame_{:06}.png", index)), encoded.into_inner())?;
        inner.written = index;
        Ok(())
    }

    fn release(&self) -> Result<(), SinkError> {
        let mut inner = self.lock();
        if inner.released {
            return Ok(());
        }
        inner.released = true;
        if let Some(dir) = &inner.dir {
            info!("Image sequence finalized: {} ({} frames)", dir.display(), inner.written);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    #[test]
    fn writes_numbered_pngs() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("clip.mp4");
        let sink = ImageSequenceSink::new();
        sink.init(&out, 30.0, (4, 2)).unwrap();

        for seq in 1..=3 {
            sink.write(&Frame::from_rgb_image(RgbImage::new(4, 2), seq)).unwrap();
        }
        sink.release().unwrap();

        assert_eq!(sink.frames_written(), 3);
        for index in 1..=3 {
            let file = out.join(format!("frame_{:06}.png", index));
            assert_eq!(image::image_dimensions(file).unwrap(), (4, 2));
        }
    }

    #[test]
    fn reinit_with_same_path_continues_numbering() {
        let dir = tempdir().unwrap();
        let sink = ImageSequenceSink::new();
        sink.init(dir.path(), 30.0, (2, 2)).unwrap();
        sink.write(&Frame::from_rgb_image(RgbImage::new(2, 2), 1)).unwrap();
        sink.init(dir.path(), 30.0, (2, 2)).unwrap();
        sink.write(&Frame::from_rgb_image(RgbImage::new(2, 2), 2)).unwrap();

        assert_eq!(sink.frames_written(), 2);
        assert!(dir.path().join("frame_000002.png").exists());
    }

    #[test]
    fn rejects_writes_outside_a_recording() {
        let dir = tempdir().unwrap();
        let sink = ImageSequenceSink::new();
        let frame = Frame::from_rgb_image(RgbImage::new(2, 2), 1);
        assert!(matches!(sink.write(&frame), Err(SinkError::NotInitialized)));

        sink.init(dir.path(), 30.0, (2, 2)).unwrap();
        sink.release().unwrap();
        sink.release().unwrap();
        assert!(matches!(sink.write(&frame), Err(SinkError::NotInitialized)));
    }

    #[test]
    fn failed_write_leaves_no_gap() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("cam1");
        let sink = ImageSequenceSink::new();
        sink.init(&out, 30.0, (2, 2)).unwrap();

        fs::remove_dir_all(&out).unwrap();
        let frame = Frame::from_rgb_image(RgbImage::new(2, 2), 1);
        assert!(matches!(sink.write(&frame), Err(SinkError::Io(_))));
        assert_eq!(sink.frames_written(), 0);

        fs::create_dir_all(&out).unwrap();
        sink.write(&Frame::from_rgb_image(RgbImage::new(2, 2), 2)).unwrap();
        assert_eq!(sink.frames_written(), 1);
        assert!(out.join("frame_000001.png").exists());
    }

    #[test]
    fn rejects_mismatched_frame_size() {
        let dir = tempdir().unwrap();
        let sink = ImageSequenceSink::new();
        sink.init(dir.path(), 30.0, (2, 2)).unwrap();
        let frame = Frame::from_rgb_image(RgbImage::new(3, 2), 1);
        assert!(matches!(sink.write(&frame), Err(SinkError::Write { .. })));
        assert_eq!(sink.frames_written(), 0);
    }
}
