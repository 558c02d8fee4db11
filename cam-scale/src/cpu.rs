// SPDX-License-Identifier: MIT
// CPU snapshot scaler built on fast_image_resize (SIMD-accelerated).
// Strided BGRA8 in, tightly packed BGRA8 out.

use fast_image_resize as fir;
use fir::images::{TypedImage, TypedImageRef};
use fir::pixels::U8x4;
use fir::{ResizeOptions, Resizer};

use crate::presets::{fit_long_side, Size};

#[derive(Debug)]
pub enum ScaleError {
    /// Source buffer shorter than `stride * height`
    SourceTooSmall { expected: usize, actual: usize },
    /// Row stride narrower than `width * 4`
    StrideTooSmall { stride: usize, min: usize },
    Fir(fir::ResizeError),
    ImageBuf(fir::ImageBufferError),
}

impl From<fir::ResizeError> for ScaleError {
    fn from(e: fir::ResizeError) -> Self {
        Self::Fir(e)
    }
}

impl From<fir::ImageBufferError> for ScaleError {
    fn from(e: fir::ImageBufferError) -> Self {
        Self::ImageBuf(e)
    }
}

impl std::fmt::Display for ScaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleError::SourceTooSmall { expected, actual } => {
                write!(f, "Source buffer too small: expected {expected} bytes, got {actual}")
            }
            ScaleError::StrideTooSmall { stride, min } => {
                write!(f, "Row stride {stride} is smaller than the {min} bytes of a row")
            }
            ScaleError::Fir(e) => write!(f, "Fast image resize error: {}", e),
            ScaleError::ImageBuf(e) => write!(f, "Image buffer error: {}", e),
        }
    }
}

impl std::error::Error for ScaleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScaleError::Fir(e) => Some(e),
            ScaleError::ImageBuf(e) => Some(e),
            _ => None,
        }
    }
}

/// Copy a possibly strided BGRA buffer into a tightly packed one.
pub fn compact_bgra(src: &[u8], size: Size, stride: usize) -> Result<Vec<u8>, ScaleError> {
    let row_bytes = (size.w as usize) * 4;
    check_source(src, size, stride)?;
    if stride == row_bytes {
        return Ok(src[..size.bgra_len()].to_vec());
    }
    let mut out = vec![0u8; size.bgra_len()];
    compact_rows(src, stride, &mut out, row_bytes, size.h as usize);
    Ok(out)
}

/// Downscale a BGRA frame so that its longest side is at most `max_long`.
///
/// Returns the tightly packed pixels and their size. Frames that already fit
/// are only compacted.
pub fn downscale_bgra(
    resizer: &mut Resizer,
    src: &[u8],
    size: Size,
    stride: usize,
    max_long: u32,
) -> Result<(Vec<u8>, Size), ScaleError> {
    let out_size = fit_long_side(size, max_long);
    let tight = compact_bgra(src, size, stride)?;
    if out_size == size {
        return Ok((tight, size));
    }

    let src_view = TypedImageRef::<U8x4>::from_buffer(size.w, size.h, &tight)?;
    let mut dst = vec![0u8; out_size.bgra_len()];
    {
        let mut dst_view = TypedImage::<U8x4>::from_buffer(out_size.w, out_size.h, &mut dst)?;
        let opts = ResizeOptions::new().use_alpha(false);
        resizer.resize_typed::<U8x4>(&src_view, &mut dst_view, &opts)?;
    }
    Ok((dst, out_size))
}

fn check_source(src: &[u8], size: Size, stride: usize) -> Result<(), ScaleError> {
    let row_bytes = (size.w as usize) * 4;
    if stride < row_bytes {
        return Err(ScaleError::StrideTooSmall { stride, min: row_bytes });
    }
    // The last row only needs its pixel bytes, not the trailing padding.
    let expected = match size.h as usize {
        0 => 0,
        rows => stride * (rows - 1) + row_bytes,
    };
    if src.len() < expected {
        return Err(ScaleError::SourceTooSmall { expected, actual: src.len() });
    }
    Ok(())
}

#[inline]
fn compact_rows(src: &[u8], src_pitch: usize, dst: &mut [u8], row_bytes: usize, rows: usize) {
    for r in 0..rows {
        let s = &src[r * src_pitch..r * src_pitch + row_bytes];
        let d = &mut dst[r * row_bytes..(r + 1) * row_bytes];
        d.copy_from_slice(s);
    }
}
