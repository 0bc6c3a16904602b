//! Pixel conversion for GPU import and CPU transforms

use std::borrow::Cow;

use thiserror::Error;

use super::frame::{FrameMetadata, PixelFormat};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(String),
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("decoded {actual:?} image for a {expected:?} frame")]
    Dimensions {
        expected: (u32, u32),
        actual: (usize, usize),
    },
    #[error("frame size overflows: {width}x{height}")]
    Oversized { width: u32, height: u32 },
}

/// Bytes in a `width` x `height` image at `bpp` bytes per pixel
pub fn image_bytes(width: u32, height: u32, bpp: u32) -> Result<usize, DecodeError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(bpp as usize))
        .ok_or(DecodeError::Oversized { width, height })
}

fn row_bytes(meta: &FrameMetadata, bpp: u32) -> Result<usize, DecodeError> {
    let packed = image_bytes(meta.width, 1, bpp)?;
    Ok(packed.max(meta.stride as usize))
}

fn check_len(data: &[u8], meta: &FrameMetadata, bpp: u32) -> Result<(), DecodeError> {
    let expected = row_bytes(meta, bpp)?
        .checked_mul(meta.height as usize)
        .ok_or(DecodeError::Oversized {
            width: meta.width,
            height: meta.height,
        })?;
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Callers run `check_len` first, so the row sizes fit in `usize`
fn rows<'a>(data: &'a [u8], meta: &FrameMetadata, bpp: u32) -> impl Iterator<Item = &'a [u8]> {
    let row_len = meta.width as usize * bpp as usize;
    let stride = row_len.max(meta.stride as usize);
    data.chunks(stride)
        .take(meta.height as usize)
        .map(move |row| &row[..row_len])
}

fn rgb_to_rgba<'a>(rows: impl Iterator<Item = &'a [u8]>, capacity: usize) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(capacity);
    for row in rows {
        for chunk in row.chunks_exact(3) {
            rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
        }
    }
    rgba
}

/// Decodes to packed RGB and checks the image matches the frame
fn decode_jpeg(data: &[u8], meta: &FrameMetadata) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| DecodeError::Jpeg(e.to_string()))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| DecodeError::Jpeg("missing image dimensions".into()))?;
    if (width, height) != (meta.width as usize, meta.height as usize) {
        return Err(DecodeError::Dimensions {
            expected: (meta.width, meta.height),
            actual: (width, height),
        });
    }
    let rgb = match decoder.get_output_colorspace().map(|c| c.num_components()) {
        Some(1) => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        _ => pixels,
    };
    let expected = image_bytes(meta.width, meta.height, 3)?;
    if rgb.len() != expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: rgb.len(),
        });
    }
    Ok(rgb)
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Converts frame bytes to tightly packed RGBA8
///
/// RGBA input without row padding is borrowed as-is.
pub fn to_rgba<'a>(data: &'a [u8], meta: &FrameMetadata) -> Result<Cow<'a, [u8]>, DecodeError> {
    let pixels = image_bytes(meta.width, meta.height, 1)?;
    match meta.format {
        PixelFormat::Rgba8 => {
            check_len(data, meta, 4)?;
            if meta.stride as usize == meta.width as usize * 4 {
                Ok(Cow::Borrowed(&data[..pixels * 4]))
            } else {
                Ok(Cow::Owned(rows(data, meta, 4).flatten().copied().collect()))
            }
        }
        PixelFormat::Rgb24 => {
            check_len(data, meta, 3)?;
            Ok(Cow::Owned(rgb_to_rgba(rows(data, meta, 3), pixels * 4)))
        }
        PixelFormat::Gray8 => {
            check_len(data, meta, 1)?;
            let mut rgba = Vec::with_capacity(pixels * 4);
            for row in rows(data, meta, 1) {
                for &l in row {
                    rgba.extend_from_slice(&[l, l, l, 255]);
                }
            }
            Ok(Cow::Owned(rgba))
        }
        PixelFormat::Yuyv4 => {
            check_len(data, meta, 2)?;
            let mut rgba = Vec::with_capacity(pixels * 4);
            for row in rows(data, meta, 2) {
                for quad in row.chunks_exact(4) {
                    let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                    let [r, g, b] = yuv_to_rgb(y0, u, v);
                    rgba.extend_from_slice(&[r, g, b, 255]);
                    let [r, g, b] = yuv_to_rgb(y1, u, v);
                    rgba.extend_from_slice(&[r, g, b, 255]);
                }
            }
            Ok(Cow::Owned(rgba))
        }
        PixelFormat::Mjpeg => {
            let rgb = decode_jpeg(data, meta)?;
            Ok(Cow::Owned(rgb_to_rgba(std::iter::once(rgb.as_slice()), pixels * 4)))
        }
    }
}

/// Extracts the luma plane as one byte per pixel
pub fn to_luma(data: &[u8], meta: &FrameMetadata) -> Result<Vec<u8>, DecodeError> {
    let pixels = image_bytes(meta.width, meta.height, 1)?;
    let luma_of = |r: u8, g: u8, b: u8| ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8;
    match meta.format {
        PixelFormat::Gray8 => {
            check_len(data, meta, 1)?;
            Ok(rows(data, meta, 1).flatten().copied().collect())
        }
        PixelFormat::Yuyv4 => {
            check_len(data, meta, 2)?;
            Ok(rows(data, meta, 2)
                .flat_map(|row| row.iter().step_by(2).copied())
                .collect())
        }
        PixelFormat::Rgba8 => {
            check_len(data, meta, 4)?;
            let mut luma = Vec::with_capacity(pixels);
            for row in rows(data, meta, 4) {
                luma.extend(row.chunks_exact(4).map(|p| luma_of(p[0], p[1], p[2])));
            }
            Ok(luma)
        }
        PixelFormat::Rgb24 => {
            check_len(data, meta, 3)?;
            let mut luma = Vec::with_capacity(pixels);
            for row in rows(data, meta, 3) {
                luma.extend(row.chunks_exact(3).map(|p| luma_of(p[0], p[1], p[2])));
            }
            Ok(luma)
        }
        PixelFormat::Mjpeg => {
            let rgb = decode_jpeg(data, meta)?;
            Ok(rgb.chunks_exact(3).map(|p| luma_of(p[0], p[1], p[2])).collect())
        }
    }
}
