//! Pixel ingestion: host RGBA bitmaps to an RGB sample grid.
//!
//! Host buffers are read through a [`PixelLock`] guard so the pixel memory is
//! released on every exit path, including validation failures after locking.

use crate::types::RgbImageGrid;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

const RGBA_BYTES_PER_PIXEL: usize = 4;

/// Pixel layout reported by the host bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit R, G, B, A in memory order. The only accepted format.
    Rgba8888,
    /// 16-bit packed 5-6-5 RGB.
    Rgb565,
    /// 16-bit packed 4-4-4-4 RGBA.
    Rgba4444,
    /// 8-bit alpha mask.
    Alpha8,
    /// Half-float RGBA.
    RgbaF16,
    /// 10-10-10-2 packed RGBA.
    Rgba1010102,
}

/// Host bitmap metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes between the starts of consecutive rows (may include padding).
    pub stride: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Error)]
pub enum PixelError {
    #[error("unsupported pixel format {0:?}: bitmap must be RGBA_8888")]
    UnsupportedFormat(PixelFormat),
    #[error("bitmap has no pixel memory")]
    NullPixels,
    #[error("invalid bitmap dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("row stride {stride} is shorter than a {min}-byte row")]
    InvalidStride { stride: usize, min: usize },
    #[error("pixel buffer too short: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("failed to lock pixels: {0}")]
    LockFailed(String),
}

/// A host-owned pixel buffer that must be locked before its memory is read.
///
/// Every successful [`lock_pixels`](Self::lock_pixels) is paired with exactly
/// one [`unlock_pixels`](Self::unlock_pixels). Use [`PixelLock`] rather than
/// calling these directly.
pub trait PixelBuffer {
    fn info(&self) -> Result<BitmapInfo, PixelError>;
    fn lock_pixels(&self) -> Result<&[u8], PixelError>;
    fn unlock_pixels(&self);
}

/// Scoped pixel lock. Unlocks the buffer when dropped.
pub struct PixelLock<'a, B: PixelBuffer + ?Sized> {
    buffer: &'a B,
    pixels: &'a [u8],
}

impl<'a, B: PixelBuffer + ?Sized> PixelLock<'a, B> {
    pub fn acquire(buffer: &'a B) -> Result<Self, PixelError> {
        let pixels = buffer.lock_pixels()?;
        Ok(Self { buffer, pixels })
    }

    pub fn pixels(&self) -> &'a [u8] {
        self.pixels
    }
}

impl<B: PixelBuffer + ?Sized> Drop for PixelLock<'_, B> {
    fn drop(&mut self) {
        self.buffer.unlock_pixels();
    }
}

/// Owned RGBA memory with an optional padded row stride.
///
/// Tracks outstanding locks so callers can verify release.
#[derive(Debug)]
pub struct RgbaBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    locks: AtomicUsize,
}

impl RgbaBuffer {
    /// Wrap raw bytes laid out as `height` rows of `stride` bytes.
    pub fn new(width: u32, height: u32, stride: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            width,
            height,
            stride,
            format: PixelFormat::Rgba8888,
            locks: AtomicUsize::new(0),
        }
    }

    /// Build a tightly packed buffer from row-major RGBA pixels.
    pub fn from_pixels(width: u32, height: u32, pixels: &[[u8; 4]]) -> Self {
        let data = pixels.iter().flatten().copied().collect();
        Self::new(width, height, width * RGBA_BYTES_PER_PIXEL as u32, data)
    }

    /// Override the reported format (hosts describing non-RGBA memory).
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Number of locks currently held.
    pub fn outstanding_locks(&self) -> usize {
        self.locks.load(Ordering::Acquire)
    }
}

impl PixelBuffer for RgbaBuffer {
    fn info(&self) -> Result<BitmapInfo, PixelError> {
        Ok(BitmapInfo {
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
        })
    }

    fn lock_pixels(&self) -> Result<&[u8], PixelError> {
        self.locks.fetch_add(1, Ordering::AcqRel);
        Ok(&self.data)
    }

    fn unlock_pixels(&self) {
        self.locks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Opaque copy of a decoded RGB image. Alpha is 255 everywhere, so ingestion
/// reads the colors back unchanged.
impl From<&image::RgbImage> for RgbaBuffer {
    fn from(img: &image::RgbImage) -> Self {
        let data = img
            .as_raw()
            .chunks_exact(3)
            .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], 255])
            .collect();
        Self::new(
            img.width(),
            img.height(),
            img.width() * RGBA_BYTES_PER_PIXEL as u32,
            data,
        )
    }
}

/// Recover a straight-alpha channel value from a premultiplied one.
///
/// Alpha 0 and 255 pass through unchanged: fully transparent pixels carry no
/// defined color, and opaque pixels are already straight.
pub fn unpremultiply(channel: u8, alpha: u8) -> u8 {
    match alpha {
        0 | 255 => channel,
        a => {
            let a = a as u32;
            ((channel as u32 * 255 + a / 2) / a).min(255) as u8
        }
    }
}

/// Read an RGBA_8888 host bitmap into an RGB sample grid.
///
/// Rows are addressed by stride, so trailing row padding is skipped. Alpha is
/// used only to un-premultiply and is then discarded.
pub fn ingest<B: PixelBuffer + ?Sized>(buffer: &B) -> Result<RgbImageGrid, PixelError> {
    let info = buffer.info()?;
    if info.format != PixelFormat::Rgba8888 {
        return Err(PixelError::UnsupportedFormat(info.format));
    }
    if info.width == 0 || info.height == 0 {
        return Err(PixelError::InvalidDimensions {
            width: info.width,
            height: info.height,
        });
    }

    let width = info.width as usize;
    let height = info.height as usize;
    let stride = info.stride as usize;
    let row_bytes = width * RGBA_BYTES_PER_PIXEL;
    if stride < row_bytes {
        return Err(PixelError::InvalidStride {
            stride,
            min: row_bytes,
        });
    }

    let lock = PixelLock::acquire(buffer)?;
    let pixels = lock.pixels();
    if pixels.is_empty() {
        return Err(PixelError::NullPixels);
    }

    // The last row needs no padding after it.
    let expected = stride * (height - 1) + row_bytes;
    if pixels.len() < expected {
        return Err(PixelError::InvalidLength {
            expected,
            actual: pixels.len(),
        });
    }

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in pixels.chunks(stride).take(height) {
        for px in row[..row_bytes].chunks_exact(RGBA_BYTES_PER_PIXEL) {
            let a = px[3];
            rgb.push(unpremultiply(px[0], a));
            rgb.push(unpremultiply(px[1], a));
            rgb.push(unpremultiply(px[2], a));
        }
    }
    drop(lock);

    tracing::trace!(width, height, stride, "ingested RGBA bitmap");

    Ok(RgbImageGrid::from_raw_unchecked(width, height, rgb))
}
