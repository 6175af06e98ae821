//! Frame sources backed by image sequences and in-memory lists

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{FrameError, FrameSource, SourceInfo, VideoFrame};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Directory of still images, read in file-name order
pub struct ImageSequenceSource {
    dir: PathBuf,
    files: VecDeque<PathBuf>,
    info: SourceInfo,
    next_index: u64,
}

impl ImageSequenceSource {
    /// Open a directory of frames. The first image fixes the reported size.
    pub fn open(dir: impl AsRef<Path>, fps: f64) -> Result<Self, FrameError> {
        let dir = dir.as_ref().to_path_buf();
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| FrameError::Open(format!("{}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        files.sort();

        let first = files
            .first()
            .ok_or_else(|| FrameError::Open(format!("no frames in {}", dir.display())))?;
        let (width, height) = image::image_dimensions(first)
            .map_err(|e| FrameError::Open(format!("{}: {}", first.display(), e)))?;

        let info = SourceInfo { width, height, fps };
        info!(
            "Opened image sequence {}: {} frames, {}x{} @ {} fps",
            dir.display(),
            files.len(),
            width,
            height,
            fps
        );

        Ok(Self {
            dir,
            files: files.into(),
            info,
            next_index: 0,
        })
    }

    /// Frames not yet read
    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<VideoFrame>, FrameError> {
        let Some(path) = self.files.pop_front() else {
            debug!("Image sequence {} exhausted", self.dir.display());
            return Ok(None);
        };

        let index = self.next_index;
        self.next_index += 1;

        let decoded = image::open(&path).map_err(|e| FrameError::Decode {
            index,
            reason: format!("{}: {}", path.display(), e),
        })?;

        let timestamp_ns = if self.info.fps > 0.0 {
            (index as f64 * 1e9 / self.info.fps) as u64
        } else {
            0
        };

        Ok(Some(VideoFrame::from_rgb_image(
            decoded.to_rgb8(),
            timestamp_ns,
            index,
        )))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// In-memory frame list
pub struct VecSource {
    frames: VecDeque<VideoFrame>,
    info: SourceInfo,
}

impl VecSource {
    pub fn new(frames: Vec<VideoFrame>, fps: f64) -> Self {
        let (width, height) = frames
            .first()
            .map(|f| (f.width, f.height))
            .unwrap_or((0, 0));
        Self {
            frames: frames.into(),
            info: SourceInfo { width, height, fps },
        }
    }
}

impl FrameSource for VecSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<VideoFrame>, FrameError> {
        Ok(self.frames.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_sequence_reads_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10u8), ("c.png", 30u8)] {
            RgbImage::from_pixel(4, 3, Rgb([shade, 0, 0]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = ImageSequenceSource::open(dir.path(), 25.0).unwrap();
        assert_eq!(source.info().width, 4);
        assert_eq!(source.info().height, 3);
        assert_eq!(source.remaining(), 3);

        let mut shades = Vec::new();
        let mut indices = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            shades.push(frame.get_pixel(0, 0).unwrap()[0]);
            indices.push(frame.index);
        }
        assert_eq!(shades, vec![10, 20, 30]);
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageSequenceSource::open(dir.path(), 30.0),
            Err(FrameError::Open(_))
        ));
    }

    #[test]
    fn test_vec_source_drains() {
        let mut source = VecSource::new(
            vec![VideoFrame::filled(2, 2, [0, 0, 0], 0), VideoFrame::filled(2, 2, [0, 0, 0], 1)],
            30.0,
        );
        assert_eq!(source.info().width, 2);
        assert_eq!(source.next_frame().unwrap().unwrap().index, 0);
        assert_eq!(source.next_frame().unwrap().unwrap().index, 1);
        assert!(source.next_frame().unwrap().is_none());
    }
}
