//! Frame type and raw buffer to grayscale conversion.

use image::GrayImage;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Wrap the pixel data as an image without copying.
    pub fn into_image(self) -> Result<GrayImage, FrameError> {
        let (width, height, actual) = (self.width, self.height, self.data.len());
        GrayImage::from_raw(width, height, self.data).ok_or(FrameError::InvalidLength {
            expected: (width * height) as usize,
            actual,
        })
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y samples.
///
/// Two pixels per 4 bytes: `[Y0, U, Y1, V]`.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert 16-bit little-endian grayscale to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// Take the first `width * height` bytes of an 8-bit grayscale buffer.
pub fn grey_to_grayscale(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    grey.get(..expected)
        .map(<[u8]>::to_vec)
        .ok_or(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let gray = yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_ignores_trailing_bytes() {
        let yuyv: Vec<u8> = (0..20).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x12ff and 0x8001, little-endian.
        let gray = y16_to_grayscale(&[0xff, 0x12, 0x01, 0x80], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0x80]);
    }

    #[test]
    fn test_grey_too_short() {
        let err = grey_to_grayscale(&[1, 2, 3], 2, 2).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_frame_into_image() {
        let frame = Frame {
            data: vec![1, 2, 3, 4, 5, 6],
            width: 3,
            height: 2,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        };
        let image = frame.into_image().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0[0], 6);
    }

    #[test]
    fn test_frame_into_image_size_mismatch() {
        let frame = Frame {
            data: vec![0; 5],
            width: 3,
            height: 2,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        };
        assert!(frame.into_image().is_err());
    }
}
