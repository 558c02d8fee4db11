//! # Frames and Raster Images
//!
//! [`Frame`] is one BGRA camera frame as it comes off the feed, possibly with
//! row padding. [`RasterImage`] is a tightly packed, immutable BGRA still: the
//! captured photo, the image handed to a description engine, or a generated
//! image.

use std::{io::Cursor, sync::Arc, time::Duration};

use cam_scale::{
    cpu::{compact_bgra, downscale_bgra},
    presets::Size,
};
use fast_image_resize::Resizer;

use crate::error::{GenError, GenResult};

/// One BGRA frame from a live feed. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`
    pub stride: usize,
    /// Presentation timestamp relative to the start of the feed
    pub pts: Option<Duration>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, stride: usize) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            stride,
            pts: None,
        }
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn size(&self) -> Size {
        Size {
            w: self.width,
            h: self.height,
        }
    }
}

/// Immutable, tightly packed BGRA image.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pixels: Arc<Vec<u8>>,
    width: u32,
    height: u32,
}

impl RasterImage {
    /// Wrap tightly packed BGRA pixels.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> GenResult<Self> {
        let expected = Size {
            w: width,
            h: height,
        }
        .bgra_len();
        if pixels.len() != expected {
            return Err(GenError::config(
                "pixels",
                pixels.len().to_string(),
                format!("expected {expected} bytes for a {width}x{height} BGRA image"),
            ));
        }
        Ok(Self {
            pixels: Arc::new(pixels),
            width,
            height,
        })
    }

    /// Single-colour image, mostly useful for placeholders and tests.
    pub fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let pixels = bgra.repeat((width as usize) * (height as usize));
        Self {
            pixels: Arc::new(pixels),
            width,
            height,
        }
    }

    /// Copy a frame into a packed image, scaled down so that its longest side
    /// is at most `max_long_side`.
    pub fn from_frame(frame: &Frame, max_long_side: u32, resizer: &mut Resizer) -> GenResult<Self> {
        let (pixels, size) =
            downscale_bgra(resizer, &frame.data, frame.size(), frame.stride, max_long_side)?;
        Ok(Self {
            pixels: Arc::new(pixels),
            width: size.w,
            height: size.h,
        })
    }

    /// Copy a frame without scaling.
    pub fn from_frame_exact(frame: &Frame) -> GenResult<Self> {
        let pixels = compact_bgra(&frame.data, frame.size(), frame.stride)?;
        Ok(Self {
            pixels: Arc::new(pixels),
            width: frame.width,
            height: frame.height,
        })
    }

    /// Decode an encoded image (PNG, JPEG, ...) into BGRA.
    pub fn decode(bytes: &[u8]) -> GenResult<Self> {
        let rgba = image::load_from_memory(bytes)?.to_rgba8();
        Ok(Self::from_rgba(rgba))
    }

    pub fn from_rgba(rgba: image::RgbaImage) -> Self {
        let (width, height) = rgba.dimensions();
        let mut pixels = rgba.into_raw();
        swap_red_blue(&mut pixels);
        Self {
            pixels: Arc::new(pixels),
            width,
            height,
        }
    }

    pub fn to_rgba(&self) -> GenResult<image::RgbaImage> {
        let mut rgba = self.pixels.as_ref().clone();
        swap_red_blue(&mut rgba);
        image::RgbaImage::from_raw(self.width, self.height, rgba)
            .ok_or_else(|| GenError::serialization("pixel buffer does not match image size"))
    }

    /// Encode as PNG.
    pub fn to_png(&self) -> GenResult<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.to_rgba()?
            .write_to(&mut out, image::ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    /// Present the image as a frame, sharing the pixel buffer.
    pub fn to_frame(&self) -> Frame {
        Frame {
            data: Arc::clone(&self.pixels),
            width: self.width,
            height: self.height,
            stride: (self.width as usize) * 4,
            pts: None,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size {
            w: self.width,
            h: self.height,
        }
    }
}

fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
}
