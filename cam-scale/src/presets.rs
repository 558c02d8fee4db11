// SPDX-License-Identifier: MIT
//! # Snapshot Sizes and Presets
//!
//! Captured photos are clamped on their longest side and scaled
//! proportionally. Images that already fit are never upscaled.

/// Represents a 2D size with width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

impl Size {
    /// Number of bytes of a tightly packed BGRA buffer of this size.
    pub fn bgra_len(self) -> usize {
        (self.w as usize) * (self.h as usize) * 4
    }

    pub fn long_side(self) -> u32 {
        self.w.max(self.h)
    }
}

/// Fit `input` so that its longest side is at most `max_long`, preserving
/// the aspect ratio. Never upscales and never returns a zero dimension.
pub fn fit_long_side(input: Size, max_long: u32) -> Size {
    let (w, h) = (f64::from(input.w), f64::from(input.h));
    let long = w.max(h);
    if long <= 0.0 || max_long == 0 {
        return Size { w: input.w.max(1), h: input.h.max(1) };
    }
    let s = (f64::from(max_long) / long).min(1.0);
    Size {
        w: ((w * s).round() as u32).max(1),
        h: ((h * s).round() as u32).max(1),
    }
}

/// Named snapshot sizes.
///
/// `Preview1024` matches what the photo preview keeps for a capture;
/// `Analysis640` trades detail for faster description passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SnapshotPreset {
    /// Longest side clamped to 1024 px
    #[default]
    #[clap(name = "preview")]
    Preview1024,
    /// Longest side clamped to 640 px
    #[clap(name = "analysis")]
    Analysis640,
    /// Keep the camera resolution
    #[clap(name = "full")]
    Full,
}

impl SnapshotPreset {
    /// Maximum longest side in pixels, `u32::MAX` for [`SnapshotPreset::Full`].
    pub fn max_long_side(self) -> u32 {
        match self {
            SnapshotPreset::Preview1024 => 1024,
            SnapshotPreset::Analysis640 => 640,
            SnapshotPreset::Full => u32::MAX,
        }
    }

    /// Output size this preset produces for an input of `input`.
    pub fn output_size(self, input: Size) -> Size {
        fit_long_side(input, self.max_long_side())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landscape_is_clamped_on_width() {
        let out = fit_long_side(Size { w: 1920, h: 1080 }, 1024);
        assert_eq!(out, Size { w: 1024, h: 576 });
    }

    #[test]
    fn portrait_is_clamped_on_height() {
        let out = fit_long_side(Size { w: 1080, h: 1920 }, 640);
        assert_eq!(out, Size { w: 360, h: 640 });
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let out = fit_long_side(Size { w: 320, h: 240 }, 1024);
        assert_eq!(out, Size { w: 320, h: 240 });
    }

    #[test]
    fn full_preset_keeps_resolution() {
        let input = Size { w: 4032, h: 3024 };
        assert_eq!(SnapshotPreset::Full.output_size(input), input);
    }
}
