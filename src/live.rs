//! # Live Analysis
//!
//! While real-time mode is on, every frame that reaches the analyze lane is
//! described, one at a time, with a short pause between passes. Frames that
//! arrive while a description is running replace each other in the lane, so
//! the next pass always works on the newest frame.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use fast_image_resize::Resizer;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DescriptionMode, StudioConfig},
    core::{
        frame::{Frame, RasterImage},
        latest_buffer::LatestReceiver,
    },
    inference::{DescriptionInput, InferenceSession},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStats {
    /// Completed description passes
    pub iterations: u64,
}

#[derive(Clone)]
pub struct LiveAnalysis {
    session: InferenceSession,
    config: Arc<StudioConfig>,
    mode: Arc<Mutex<DescriptionMode>>,
}

impl LiveAnalysis {
    pub fn new(session: InferenceSession, config: Arc<StudioConfig>) -> Self {
        Self {
            session,
            config,
            mode: Arc::new(Mutex::new(DescriptionMode::Short)),
        }
    }

    /// Applies from the next pass on.
    pub fn set_mode(&self, mode: DescriptionMode) {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner()) = mode;
    }

    pub fn mode(&self) -> DescriptionMode {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Describe frames from `lane` until it closes or `cancel` fires.
    ///
    /// Hands the lane back so that a later run can pick up where this one
    /// stopped.
    pub async fn run(
        &self,
        mut lane: LatestReceiver<Frame>,
        cancel: CancellationToken,
    ) -> (LatestReceiver<Frame>, LiveStats) {
        let mut stats = LiveStats::default();
        let mut resizer = Resizer::new();
        let max_side = self.config.snapshot_preset.max_long_side();
        info!("Live analysis started");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = lane.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        debug!("Analyze lane closed");
                        break;
                    }
                },
            };

            let image = match RasterImage::from_frame(&frame, max_side, &mut resizer) {
                Ok(image) => image,
                Err(e) => {
                    warn!("Skipping frame that could not be converted: {}", e);
                    continue;
                }
            };
            let prompt = self.config.prompt_for(self.mode());
            let handle = self
                .session
                .generate(DescriptionInput::new(prompt, image), false);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = handle.wait() => {}
            }
            stats.iterations += 1;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.frame_delay()) => {}
            }
        }

        info!("Live analysis stopped after {} passes", stats.iterations);
        (lane, stats)
    }

    fn frame_delay(&self) -> Duration {
        self.config.frame_delay
    }
}
