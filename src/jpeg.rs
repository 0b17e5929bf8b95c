//! JPEG boundary.
//!
//! BLOB streams are captured as packed RGB888 and compressed in place once
//! the frame is back from the hardware. The last [`JPEG_BLOB_TRAILER_SIZE`]
//! bytes of the buffer carry the camera3 blob trailer: `jpeg_blob_id`
//! (u16 LE, `0x00FF`), two bytes of padding and `jpeg_size` (u32 LE).

use crate::buffer::{CameraBuffer, PixelFormat, JPEG_BLOB_TRAILER_SIZE};
use hal_core::metadata::tags;
use hal_core::{CameraMetadata, HalError, HalResult};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, error};

/// Marker of the trailer at the end of a BLOB buffer.
pub const JPEG_BLOB_ID: u16 = 0x00FF;
/// Quality used when the request does not set one.
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Compresses a YUV buffer into JPEG.
pub trait JpegMaker: Send + Sync {
    /// Compress `buffer` in place; returns the JPEG size in bytes.
    fn handle_jpeg(&self, settings: &CameraMetadata, buffer: &CameraBuffer) -> HalResult<usize>;
}

/// Encoder backed by the `image` crate.
#[derive(Debug, Default)]
pub struct ImageJpegMaker;

impl ImageJpegMaker {
    /// Encoder with default settings.
    pub fn new() -> Self {
        Self
    }
}

fn quality_from(settings: &CameraMetadata) -> u8 {
    settings
        .find_u8(tags::JPEG_QUALITY)
        .filter(|q| (1..=100).contains(q))
        .unwrap_or(DEFAULT_JPEG_QUALITY)
}

/// Parse the blob trailer at the end of `data`, returning the JPEG size.
pub fn read_blob_trailer(data: &[u8]) -> Option<usize> {
    let trailer = data.get(data.len().checked_sub(JPEG_BLOB_TRAILER_SIZE)?..)?;
    let id = u16::from_le_bytes([trailer[0], trailer[1]]);
    if id != JPEG_BLOB_ID {
        return None;
    }
    let size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    Some(size as usize)
}

impl JpegMaker for ImageJpegMaker {
    fn handle_jpeg(&self, settings: &CameraMetadata, buffer: &CameraBuffer) -> HalResult<usize> {
        if buffer.format() != PixelFormat::Blob {
            return Err(HalError::BadValue(format!(
                "jpeg requested for {:?} buffer",
                buffer.format()
            )));
        }
        let (width, height) = (buffer.width(), buffer.height());
        let rgb_len = width as usize * height as usize * 3;
        let quality = quality_from(settings);

        let mut data = buffer.lock_data();
        let capacity = data.len();
        if capacity < rgb_len + JPEG_BLOB_TRAILER_SIZE {
            return Err(HalError::BadValue(format!(
                "blob buffer of {capacity} bytes too small for {width}x{height}"
            )));
        }

        let mut encoded = Vec::with_capacity(rgb_len / 4);
        JpegEncoder::new_with_quality(&mut encoded, quality)
            .encode(&data[..rgb_len], width, height, ExtendedColorType::Rgb8)
            .map_err(|e| {
                error!(width, height, error = %e, "jpeg encode failed");
                HalError::UnknownError(format!("jpeg encode: {e}"))
            })?;

        let limit = capacity - JPEG_BLOB_TRAILER_SIZE;
        if encoded.len() > limit {
            return Err(HalError::NoMemory(format!(
                "jpeg of {} bytes does not fit in {limit}",
                encoded.len()
            )));
        }
        let size = u32::try_from(encoded.len())
            .map_err(|_| HalError::NoMemory("jpeg larger than 4 GiB".into()))?;

        data[..encoded.len()].copy_from_slice(&encoded);
        let trailer = &mut data[limit..];
        trailer[..2].copy_from_slice(&JPEG_BLOB_ID.to_le_bytes());
        trailer[2..4].fill(0);
        trailer[4..].copy_from_slice(&size.to_le_bytes());
        drop(data);

        buffer.set_bytes_used(capacity);
        debug!(width, height, quality, size, "jpeg encoded");
        Ok(encoded.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_blob(width: u32, height: u32) -> CameraBuffer {
        let buffer = CameraBuffer::allocate_internal(width, height, PixelFormat::Blob);
        {
            let mut data = buffer.lock_data();
            let rgb = (width * height * 3) as usize;
            for (i, b) in data[..rgb].iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
        }
        buffer
    }

    #[test]
    fn test_encodes_in_place_with_trailer() {
        let buffer = gradient_blob(32, 24);
        let mut settings = CameraMetadata::new();
        settings.update(tags::JPEG_QUALITY, 80_u8);

        let size = ImageJpegMaker::new().handle_jpeg(&settings, &buffer).unwrap();
        assert!(size > 0);

        let data = buffer.lock_data();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(read_blob_trailer(&data), Some(size));
    }

    #[test]
    fn test_rejects_non_blob() {
        let buffer = CameraBuffer::allocate_internal(8, 8, PixelFormat::Ycbcr420);
        let result = ImageJpegMaker::new().handle_jpeg(&CameraMetadata::new(), &buffer);
        assert!(matches!(result, Err(HalError::BadValue(_))));
    }

    #[test]
    fn test_quality_out_of_range_uses_default() {
        let mut settings = CameraMetadata::new();
        settings.update(tags::JPEG_QUALITY, 0_u8);
        assert_eq!(quality_from(&settings), DEFAULT_JPEG_QUALITY);
        settings.update(tags::JPEG_QUALITY, 42_u8);
        assert_eq!(quality_from(&settings), 42);
    }

    #[test]
    fn test_trailer_requires_blob_id() {
        assert_eq!(read_blob_trailer(&[0u8; 16]), None);
        assert_eq!(read_blob_trailer(&[0u8; 3]), None);
    }
}
