//! Frame sources
//!
//! Collaborator contract for frame ingestion plus the built-in file-based
//! source. Live backends (cameras, RTSP) plug in through the same trait.

use std::path::PathBuf;

use image::RgbImage;
use tracing::debug;

use crate::error::SourceError;

use super::preprocess::decode_image;

/// Result of a single read attempt.
pub enum ReadOutcome {
    Frame(RgbImage),
    /// The source has no further frames; finite sources end here.
    EndOfStream,
    /// A failed read that a live source will retry after a short pause.
    Transient,
}

/// Opens readers for source descriptors.
pub trait FrameSource: Send + Sync {
    fn open(&self, descriptor: &str) -> Result<Box<dyn FrameReader>, SourceError>;
}

/// A handle onto an opened source, owned by the capture stage.
pub trait FrameReader: Send {
    fn read(&mut self) -> ReadOutcome;

    /// Live sources never end on their own; their transient read failures
    /// are retried indefinitely. Finite sources treat a failed read as
    /// end-of-stream.
    fn is_live(&self) -> bool;
}

/// Finite source reading an ordered sequence of still images from a
/// directory, the descriptor being the directory path.
pub struct ImageDirSource;

impl FrameSource for ImageDirSource {
    fn open(&self, descriptor: &str) -> Result<Box<dyn FrameReader>, SourceError> {
        let entries = std::fs::read_dir(descriptor).map_err(|err| SourceError::Open {
            descriptor: descriptor.to_string(),
            reason: err.to_string(),
        })?;

        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("jpg") | Some("jpeg") | Some("png") | Some("bmp")
                )
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(SourceError::Open {
                descriptor: descriptor.to_string(),
                reason: "directory contains no image frames".to_string(),
            });
        }

        debug!("opened image sequence '{}' ({} frames)", descriptor, frames.len());
        Ok(Box::new(ImageDirReader { frames, next: 0 }))
    }
}

struct ImageDirReader {
    frames: Vec<PathBuf>,
    next: usize,
}

impl FrameReader for ImageDirReader {
    fn read(&mut self) -> ReadOutcome {
        let Some(path) = self.frames.get(self.next) else {
            return ReadOutcome::EndOfStream;
        };
        self.next += 1;

        // A failed read on a finite source is terminal, not transient.
        match std::fs::read(path).map_err(anyhow::Error::from).and_then(|bytes| decode_image(&bytes)) {
            Ok(frame) => ReadOutcome::Frame(frame),
            Err(err) => {
                tracing::warn!("frame {} unreadable, ending stream: {err:#}", path.display());
                ReadOutcome::EndOfStream
            }
        }
    }

    fn is_live(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_frame(dir: &std::path::Path, name: &str) {
        let frame = RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        frame.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_open_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = ImageDirSource.open(dir.path().to_str().unwrap());
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }

    #[test]
    fn test_open_missing_directory_fails() {
        let result = ImageDirSource.open("/nonexistent/frames");
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }

    #[test]
    fn test_reads_frames_in_order_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "0001.png");
        write_frame(dir.path(), "0002.png");

        let mut reader = ImageDirSource.open(dir.path().to_str().unwrap()).unwrap();
        assert!(!reader.is_live());
        assert!(matches!(reader.read(), ReadOutcome::Frame(_)));
        assert!(matches!(reader.read(), ReadOutcome::Frame(_)));
        assert!(matches!(reader.read(), ReadOutcome::EndOfStream));
        assert!(matches!(reader.read(), ReadOutcome::EndOfStream));
    }

    #[test]
    fn test_corrupt_frame_ends_finite_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0001.jpg"), b"not an image").unwrap();

        let mut reader = ImageDirSource.open(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(reader.read(), ReadOutcome::EndOfStream));
    }
}
