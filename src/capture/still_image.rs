// # Still Image Source
//
// Replays one decoded image as a camera feed. Used by the CLI to describe
// photos from disk and by tests that need a deterministic feed.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use cam_scale::presets::Size;
use log::info;

use crate::{
    capture::source::FrameSource,
    core::frame::{Frame, RasterImage},
};

pub struct StillImageSource {
    image: RasterImage,
    repeat: Option<usize>,
    interval: Duration,
    emitted: usize,
}

impl StillImageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        let image = RasterImage::decode(&bytes)
            .with_context(|| format!("Failed to decode image {}", path.display()))?;
        info!(
            "Loaded {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(Self::from_image(image))
    }

    /// Emits the image once.
    pub fn from_image(image: RasterImage) -> Self {
        Self {
            image,
            repeat: Some(1),
            interval: Duration::ZERO,
            emitted: 0,
        }
    }

    /// Number of frames to emit; `None` replays forever.
    pub fn with_repeat(mut self, repeat: Option<usize>) -> Self {
        self.repeat = repeat;
        self
    }

    /// Pause between frames.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn image(&self) -> &RasterImage {
        &self.image
    }
}

#[async_trait]
impl FrameSource for StillImageSource {
    fn input_size(&self) -> Size {
        self.image.size()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.emitted = 0;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.repeat.is_some_and(|n| self.emitted >= n) {
            return Ok(None);
        }
        if self.emitted > 0 && !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
        let pts = self.interval * self.emitted as u32;
        self.emitted += 1;
        Ok(Some(self.image.to_frame().with_pts(pts)))
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
