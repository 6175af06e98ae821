//! Video frame types and processing

use crate::FrameError;
use image::RgbImage;

/// Integer pixel rectangle inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Decoded RGB video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Packed RGB pixel data (width * height * 3)
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Capture or decode timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Monotonically increasing frame index within its source
    pub index: u64,
}

impl VideoFrame {
    /// Create a new video frame from raw RGB data
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp_ns: u64, index: u64) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ns,
            index,
        }
    }

    /// Solid-colour frame, mostly useful in tests and tools
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], index: u64) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(data, width, height, 0, index)
    }

    /// Wrap a decoded image
    pub fn from_rgb_image(image: RgbImage, timestamp_ns: u64, index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, timestamp_ns, index)
    }

    /// Copy the pixels into an `image` buffer
    pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
        self.validate()?;
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| FrameError::Geometry("buffer does not match dimensions".into()))
    }

    /// Check that the buffer length matches the dimensions
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Geometry(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize * 3;
        if self.data.len() != expected {
            return Err(FrameError::Geometry(format!(
                "expected {} bytes for {}x{}, got {}",
                expected,
                self.width,
                self.height,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Get pixel at (x, y)
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize * self.width as usize) + x as usize) * 3;
        self.data
            .get(idx..idx + 3)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// Crop a region of the frame
    pub fn crop(&self, rect: PixelRect) -> Result<VideoFrame, FrameError> {
        self.validate()?;
        if rect.width == 0 || rect.height == 0 {
            return Err(FrameError::Geometry(format!("empty crop {:?}", rect)));
        }
        if rect.x as u64 + rect.width as u64 > self.width as u64
            || rect.y as u64 + rect.height as u64 > self.height as u64
        {
            return Err(FrameError::Geometry(format!(
                "crop {:?} outside {}x{} frame",
                rect, self.width, self.height
            )));
        }

        let row_bytes = rect.width as usize * 3;
        let mut cropped = Vec::with_capacity(row_bytes * rect.height as usize);
        for row in rect.y..(rect.y + rect.height) {
            let start = (row as usize * self.width as usize + rect.x as usize) * 3;
            cropped.extend_from_slice(&self.data[start..start + row_bytes]);
        }

        Ok(VideoFrame {
            data: cropped,
            width: rect.width,
            height: rect.height,
            timestamp_ns: self.timestamp_ns,
            index: self.index,
        })
    }
}
