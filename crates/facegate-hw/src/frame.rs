//! Frame type and pixel format conversion to RGB.

use image::RgbImage;
use thiserror::Error;

/// A captured camera frame, converted to RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Convert packed YUYV 4:2:2 to RGB using BT.601 coefficients.
///
/// Every 4 bytes `[Y0, U, Y1, V]` yield two pixels sharing U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Decode one MJPEG buffer into RGB.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory(jpeg)?.to_rgb8())
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_grey_stays_grey() {
        // U = V = 128 carries no colour.
        let yuyv = [200u8, 128, 50, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([200, 200, 200]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([50, 50, 50]));
    }

    #[test]
    fn test_yuyv_red_chroma() {
        let yuyv = [76u8, 85, 76, 255];
        let px = *yuyv_to_rgb(&yuyv, 2, 1).unwrap().get_pixel(0, 0);
        assert!(px[0] > 240 && px[1] < 10 && px[2] < 10, "{px:?}");
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let err = yuyv_to_rgb(&[0u8; 6], 2, 2).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { expected: 8, actual: 6 }));
    }

    #[test]
    fn test_mjpeg_decode() {
        let src = RgbImage::from_pixel(16, 8, Rgb([10, 200, 30]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new(&mut jpeg)
            .encode_image(&src)
            .unwrap();
        let decoded = mjpeg_to_rgb(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
        assert!(mjpeg_to_rgb(b"not a jpeg").is_err());
    }
}
