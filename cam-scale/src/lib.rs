// SPDX-License-Identifier: MIT
//! # cam-scale: Snapshot Downscaling for Camera Captures
//!
//! Turns a live BGRA camera frame into a bounded-size still that can outlive
//! the frame stream: the photo shown while descriptions and generated images
//! are computed, and the image handed to the description model.
//!
//! ## Key Components
//!
//! - [`presets`]: size computation and the named snapshot presets
//! - [`cpu`]: SIMD resize through `fast_image_resize`, stride aware
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use cam_scale::{cpu::downscale_bgra, presets::{SnapshotPreset, Size}};
//!
//! let frame = vec![0u8; 1920 * 1080 * 4];
//! let mut resizer = fast_image_resize::Resizer::new();
//! let (pixels, size) = downscale_bgra(
//!     &mut resizer,
//!     &frame,
//!     Size { w: 1920, h: 1080 },
//!     1920 * 4,
//!     SnapshotPreset::Preview1024.max_long_side(),
//! )?;
//! assert_eq!((size.w, size.h), (1024, 576));
//! assert_eq!(pixels.len(), 1024 * 576 * 4);
//! # Ok::<(), cam_scale::cpu::ScaleError>(())
//! ```

pub mod cpu;
pub mod presets;
