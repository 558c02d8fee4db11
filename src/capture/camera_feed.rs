// # Camera Feed
//
// Bridges a push-based camera callback into a pull-based `FrameSource`.
// The camera thread pushes into a latest-wins buffer of one, so a slow
// consumer only ever sees the newest frame and the camera never blocks.

use std::{sync::Arc, time::Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use cam_scale::presets::Size;
use log::{debug, info};

use crate::{
    capture::source::FrameSource,
    core::{
        frame::Frame,
        latest_buffer::{BufferStats, LatestReceiver, LatestSender, latest_channel},
    },
};

/// The consuming side of a camera.
pub struct CameraFeed {
    size: Size,
    frames: LatestReceiver<Frame>,
    running: bool,
}

/// The camera callback's side. Cloneable; the feed ends when every handle is
/// dropped or [`CameraFeedHandle::finish`] is called.
#[derive(Clone)]
pub struct CameraFeedHandle {
    frames: Arc<LatestSender<Frame>>,
    started: Instant,
}

impl CameraFeed {
    pub fn new(size: Size) -> (CameraFeed, CameraFeedHandle) {
        let (tx, rx) = latest_channel();
        (
            CameraFeed {
                size,
                frames: rx,
                running: false,
            },
            CameraFeedHandle {
                frames: Arc::new(tx),
                started: Instant::now(),
            },
        )
    }

    pub fn stats(&self) -> BufferStats {
        self.frames.stats()
    }
}

impl CameraFeedHandle {
    /// Hand a frame to the feed, replacing an unread one. Frames without a
    /// timestamp are stamped with the time since the feed was created.
    /// Returns `false` once the feed has ended.
    pub fn push(&self, frame: Frame) -> bool {
        let frame = match frame.pts {
            Some(_) => frame,
            None => frame.with_pts(self.started.elapsed()),
        };
        self.frames.push(frame).is_ok()
    }

    pub fn finish(&self) {
        self.frames.close();
    }

    pub fn is_finished(&self) -> bool {
        self.frames.is_closed()
    }
}

#[async_trait]
impl FrameSource for CameraFeed {
    fn input_size(&self) -> Size {
        self.size
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.frames.is_closed() {
            bail!("camera feed was closed before it started");
        }
        self.running = true;
        info!("Camera feed started ({}x{})", self.size.w, self.size.h);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.running {
            bail!("camera feed is not running");
        }
        Ok(self.frames.recv().await)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.running = false;
        let stats = self.frames.stats();
        debug!(
            "Camera feed stopped: {} frames pushed, {} replaced before delivery",
            stats.pushed, stats.dropped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::frame_stream;
    use futures_util::StreamExt;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 16], 2, 2, 8)
    }

    #[tokio::test]
    async fn stream_yields_latest_frame_and_ends() {
        let (feed, handle) = CameraFeed::new(Size { w: 2, h: 2 });
        assert!(handle.push(frame(1)));
        assert!(handle.push(frame(2)));
        handle.finish();
        assert!(!handle.push(frame(3)));

        let frames: Vec<Frame> = frame_stream(Box::new(feed)).collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data[0], 2);
        assert!(frames[0].pts.is_some());
    }

    #[tokio::test]
    async fn waiting_feed_receives_pushed_frame() {
        let (mut feed, handle) = CameraFeed::new(Size { w: 2, h: 2 });
        feed.initialize().await.unwrap();
        let producer = tokio::spawn(async move {
            handle.push(frame(9));
        });
        let next = feed.next_frame().await.unwrap();
        producer.await.unwrap();
        assert_eq!(next.map(|f| f.data[0]), Some(9));
    }
}
