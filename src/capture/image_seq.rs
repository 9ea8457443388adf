//! Finite source over a directory of still images

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, StreamDescriptor};
use crate::capture::source::{Connection, Connector};
use crate::error::SourceError;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Opens a directory as a stream: one frame per image, in file-name order.
///
/// Images that cannot be decoded are skipped. A reconnect resumes after the
/// last image already handed out instead of starting the directory over.
pub struct ImageSequenceConnector {
    fps: f64,
    progress: Arc<Mutex<Progress>>,
}

/// Position in the directory, shared by the connector and its connections
#[derive(Debug, Default)]
struct Progress {
    /// Last image read or skipped
    last: Option<PathBuf>,
    /// Frames handed out over every connection so far
    delivered: u64,
    frame_size: Option<(u32, u32)>,
}

fn lock(progress: &Mutex<Progress>) -> MutexGuard<'_, Progress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ImageSequenceConnector {
    pub fn new(fps: f64) -> Self {
        Self {
            fps,
            progress: Arc::default(),
        }
    }

    /// List the images a directory would stream, sorted by file name
    pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if path.is_file() && is_image {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Connector for ImageSequenceConnector {
    fn open(&mut self, locator: &str) -> Result<Box<dyn Connection>, SourceError> {
        let files = Self::list_images(Path::new(locator))?;
        let (resume_after, delivered, mut frame_size) = {
            let progress = lock(&self.progress);
            (progress.last.clone(), progress.delivered, progress.frame_size)
        };

        // Header check only; a body that fails to decode is skipped on read
        let mut readable = Vec::new();
        for path in files {
            if resume_after.as_ref().is_some_and(|last| path <= *last) {
                continue;
            }
            match image::image_dimensions(&path) {
                Ok(dimensions) => {
                    frame_size.get_or_insert(dimensions);
                    readable.push(path);
                }
                Err(e) => warn!("Skipping unreadable image {}: {}", path.display(), e),
            }
        }

        let (width, height) = frame_size.ok_or_else(|| SourceError::Open {
            locator: locator.to_string(),
            reason: "directory contains no readable images".into(),
        })?;
        lock(&self.progress).frame_size = Some((width, height));

        if delivered > 0 {
            info!(
                "Resuming image sequence {} after {} frames ({} images left)",
                locator,
                delivered,
                readable.len()
            );
        } else {
            info!(
                "Opened image sequence {} ({} images, {}x{})",
                locator,
                readable.len(),
                width,
                height
            );
        }

        Ok(Box::new(ImageSequence {
            descriptor: StreamDescriptor {
                width,
                height,
                fps: self.fps,
                total_frames: Some(delivered + readable.len() as u64),
            },
            files: readable,
            next: 0,
            progress: self.progress.clone(),
            open: true,
        }))
    }
}

struct ImageSequence {
    files: Vec<PathBuf>,
    descriptor: StreamDescriptor,
    next: usize,
    progress: Arc<Mutex<Progress>>,
    open: bool,
}

impl Connection for ImageSequence {
    fn is_open(&self) -> bool {
        self.open
    }

    fn descriptor(&self) -> StreamDescriptor {
        self.descriptor
    }

    fn read_frame(&mut self, sequence: u64) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }

        while let Some(path) = self.files.get(self.next) {
            self.next += 1;
            debug!("Decoding {}", path.display());
            let decoded = image::open(path);

            let mut progress = lock(&self.progress);
            progress.last = Some(path.clone());
            match decoded {
                Ok(image) => {
                    progress.delivered += 1;
                    return Ok(Frame::from_rgb_image(image.to_rgb8(), sequence));
                }
                Err(e) => warn!("Skipping undecodable image {}: {}", path.display(), e),
            }
        }
        Err(SourceError::Read("end of image sequence".into()))
    }

    fn release(&mut self) {
        self.open = false;
    }
}
