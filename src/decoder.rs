//! Tile decoding into in-memory pixmaps.
//!
//! Tiles are stored as PNG or JPEG blobs; everything is normalized to
//! RGBA8 on decode so one cached tile always costs `w * h * 4` bytes.

use bytes::Bytes;
use image::GenericImageView;

use crate::error::{MapError, MapResult};

/// Decoded RGBA8 image.
#[derive(Debug, Clone)]
pub struct Pixmap {
    /// Raw RGBA pixel data, row-major, 4 bytes per pixel.
    pub data: Bytes,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Pixmap {
    /// Create a pixmap from raw RGBA bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Bytes::from(data),
            width,
            height,
        }
    }

    /// Size of the pixel data in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Decode a PNG or JPEG byte buffer into an RGBA8 pixmap.
pub fn decode_tile(buf: &[u8]) -> MapResult<Pixmap> {
    let img = image::load_from_memory(buf)
        .map_err(|e| MapError::Decode(e.to_string()))?;

    let (width, height) = img.dimensions();
    let rgba = img.into_rgba8();

    Ok(Pixmap::new(rgba.into_raw(), width, height))
}
