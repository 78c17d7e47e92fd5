//! Frame type and pixel conversion: RGBA/grayscale/image decoding into one
//! canonical packed RGB8 buffer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid {format} buffer length for {width}x{height}: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// A decoded frame, packed RGB8 row-major (`width * height * 3` bytes).
#[derive(Debug, Clone)]
pub struct FrameSample {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl FrameSample {
    /// Wrap a packed RGB8 buffer.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                format: "RGB8",
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    /// Convert a packed RGBA8 buffer, dropping alpha.
    pub fn from_rgba(width: u32, height: u32, rgba: &[u8]) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(FrameError::InvalidLength {
                format: "RGBA8",
                width,
                height,
                expected,
                actual: rgba.len(),
            });
        }
        let data = rgba
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        Ok(Self { data, width, height })
    }

    /// Convert an 8-bit grayscale buffer by replicating Y into each channel.
    pub fn from_gray(width: u32, height: u32, gray: &[u8]) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if gray.len() != expected {
            return Err(FrameError::InvalidLength {
                format: "GRAY8",
                width,
                height,
                expected,
                actual: gray.len(),
            });
        }
        let data = gray.iter().flat_map(|&y| [y, y, y]).collect();
        Ok(Self { data, width, height })
    }

    /// Convert any decoded image.
    pub fn from_image(img: &image::DynamicImage) -> Self {
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            data: rgb.into_raw(),
            width,
            height,
        }
    }

    /// Decode an encoded image (PNG, JPEG, ...) from memory.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(&img))
    }

    /// Decode an image file from disk.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, FrameError> {
        let img = image::open(path)?;
        Ok(Self::from_image(&img))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGB triple at `(x, y)`. Caller guarantees bounds.
    #[inline]
    pub fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Rec. 601 luminance plane (0.0–255.0), row-major.
    pub fn luminance(&self) -> Vec<f32> {
        self.data
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]))
            .collect()
    }
}

#[inline]
fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_rejects_short_buffer() {
        let err = FrameSample::from_rgb(2, 2, vec![0; 11]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength { expected: 12, actual: 11, .. }
        ));
    }

    #[test]
    fn test_from_rgba_drops_alpha() {
        let rgba = vec![10, 20, 30, 255, 40, 50, 60, 0];
        let frame = FrameSample::from_rgba(2, 1, &rgba).unwrap();
        assert_eq!(frame.rgb(0, 0), [10, 20, 30]);
        assert_eq!(frame.rgb(1, 0), [40, 50, 60]);
    }

    #[test]
    fn test_from_gray_replicates_channels() {
        let frame = FrameSample::from_gray(2, 1, &[7, 200]).unwrap();
        assert_eq!(frame.rgb(0, 0), [7, 7, 7]);
        assert_eq!(frame.rgb(1, 0), [200, 200, 200]);
    }

    #[test]
    fn test_luminance_of_gray_is_identity() {
        let frame = FrameSample::from_gray(3, 1, &[0, 128, 255]).unwrap();
        let lum = frame.luminance();
        assert!((lum[0] - 0.0).abs() < 1e-3);
        assert!((lum[1] - 128.0).abs() < 1e-3);
        assert!((lum[2] - 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_from_image_dimensions() {
        let img = image::DynamicImage::new_rgb8(5, 3);
        let frame = FrameSample::from_image(&img);
        assert_eq!((frame.width(), frame.height()), (5, 3));
        assert!(frame.luminance().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(FrameSample::decode(b"not an image").is_err());
    }
}
