//! Frame encoding for the rolling buffer.

use std::io::Cursor;

use image::{ColorType, ImageFormat};

use crate::camera::RawFrame;
use crate::error::CaptureError;

pub trait FrameEncoder: Send {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, CaptureError>;
}

/// Encodes RGB8 frames with the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageEncoder {
    format: ImageFormat,
}

impl ImageEncoder {
    /// `extension` is the configured `IMG_TYPE`, e.g. `png`.
    pub fn from_extension(extension: &str) -> Result<Self, CaptureError> {
        let format = ImageFormat::from_extension(extension)
            .filter(|f| f.writing_enabled())
            .ok_or_else(|| CaptureError::Encode(format!("no encoder for .{extension}")))?;
        Ok(ImageEncoder { format })
    }
}

impl FrameEncoder for ImageEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, CaptureError> {
        let expected = RawFrame::expected_len(frame.width, frame.height);
        if frame.pixels.len() != expected {
            return Err(CaptureError::Encode(format!(
                "frame is {} bytes, expected {expected} for {}x{}",
                frame.pixels.len(),
                frame.width,
                frame.height
            )));
        }

        let mut out = Cursor::new(Vec::with_capacity(expected / 2));
        image::write_buffer_with_format(
            &mut out,
            &frame.pixels,
            frame.width,
            frame.height,
            ColorType::Rgb8,
            self.format,
        )
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FrameSource, SyntheticSource};

    #[test]
    fn test_png_encode_decodes_back() {
        let mut source = SyntheticSource::new(16, 8);
        let frame = source.read_frame().unwrap();
        let encoder = ImageEncoder::from_extension("png").unwrap();
        let blob = encoder.encode(&frame).unwrap();
        assert_eq!(&blob[1..4], b"PNG");

        let decoded = image::load_from_memory(&blob).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8));
        assert_eq!(decoded.into_raw(), frame.pixels);
    }

    #[test]
    fn test_rejects_short_frame() {
        let encoder = ImageEncoder::from_extension("png").unwrap();
        let frame = RawFrame {
            width: 4,
            height: 4,
            pixels: vec![0; 10],
        };
        assert!(matches!(encoder.encode(&frame), Err(CaptureError::Encode(_))));
    }

    #[test]
    fn test_unknown_extension() {
        assert!(ImageEncoder::from_extension("webm").is_err());
    }
}
