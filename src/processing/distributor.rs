//! # Frame Distributor
//!
//! Fans one frame stream out to two consumers:
//!
//! ```text
//!                         ┌──▶ display lane (latest-wins, always)
//! frames ──▶ distributor ─┤
//!                         ├──▶ analyze lane (latest-wins, real-time mode only)
//!                         └──▶ latest frame slot (for single-shot capture)
//! ```
//!
//! Both lanes hold at most one unread frame. The real-time flag is read for
//! every frame, so toggling it takes effect on the next frame. When the input
//! ends both lanes are closed; consumers drain what is left and then see
//! `None`.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use futures_util::{Stream, StreamExt};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::core::{
    frame::Frame,
    latest_buffer::{LatestReceiver, LatestSender, latest_channel},
};

/// Shared real-time mode switch.
#[derive(Debug, Clone, Default)]
pub struct RealtimeFlag(Arc<AtomicBool>);

impl RealtimeFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The most recent frame, kept for single-shot capture.
#[derive(Debug, Clone, Default)]
pub struct LatestFrame(Arc<Mutex<Option<Frame>>>);

impl LatestFrame {
    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, frame: Frame) {
        *self.lock() = Some(frame);
    }

    pub fn get(&self) -> Option<Frame> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().take();
    }
}

pub struct FrameLanes {
    pub display: LatestReceiver<Frame>,
    pub analyze: LatestReceiver<Frame>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributorStats {
    /// Frames received from the input
    pub frames: u64,
    /// Frames offered to the analyze lane
    pub analyzed: u64,
}

pub struct FrameDistributor {
    display: LatestSender<Frame>,
    analyze: LatestSender<Frame>,
    realtime: RealtimeFlag,
    latest: LatestFrame,
}

impl FrameDistributor {
    pub fn new(realtime: RealtimeFlag, latest: LatestFrame) -> (Self, FrameLanes) {
        let (display_tx, display_rx) = latest_channel();
        let (analyze_tx, analyze_rx) = latest_channel();
        (
            Self {
                display: display_tx,
                analyze: analyze_tx,
                realtime,
                latest,
            },
            FrameLanes {
                display: display_rx,
                analyze: analyze_rx,
            },
        )
    }

    /// Distribute frames until the input ends or `cancel` fires, then close
    /// both lanes.
    pub async fn run<S>(self, frames: S, cancel: CancellationToken) -> DistributorStats
    where
        S: Stream<Item = Frame>,
    {
        let mut frames = std::pin::pin!(frames);
        let mut stats = DistributorStats::default();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Frame distribution cancelled");
                    break;
                }
                frame = frames.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            stats.frames += 1;
            let realtime = self.realtime.get();

            // A consumer that went away does not stop the other lanes.
            self.latest.set(frame.clone());
            let _ = self.display.push(frame.clone());
            if realtime {
                stats.analyzed += 1;
                let _ = self.analyze.push(frame);
            }
        }

        self.display.close();
        self.analyze.close();
        let display = self.display.stats();
        let analyze = self.analyze.stats();
        info!(
            "Frame distribution finished: {} frames, {} analyzed, {} display and {} analysis frames replaced unread",
            stats.frames, stats.analyzed, display.dropped, analyze.dropped
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 4], 1, 1, 4)
    }

    #[tokio::test]
    async fn analyze_lane_follows_realtime_flag() {
        let realtime = RealtimeFlag::new(false);
        let latest = LatestFrame::default();
        let (distributor, mut lanes) = FrameDistributor::new(realtime.clone(), latest.clone());

        let (tx, rx) = latest_channel();
        let run = tokio::spawn(distributor.run(rx.into_stream(), CancellationToken::new()));

        tx.push(frame(1)).unwrap();
        assert_eq!(lanes.display.recv().await.map(|f| f.data[0]), Some(1));
        realtime.set(true);
        tx.push(frame(2)).unwrap();
        assert_eq!(lanes.display.recv().await.map(|f| f.data[0]), Some(2));
        drop(tx);

        let stats = run.await.unwrap();
        assert_eq!(stats, DistributorStats { frames: 2, analyzed: 1 });
        assert_eq!(lanes.analyze.recv().await.map(|f| f.data[0]), Some(2));
        assert_eq!(lanes.analyze.recv().await.map(|f| f.data[0]), None);
        assert_eq!(latest.get().map(|f| f.data[0]), Some(2));
    }

    #[tokio::test]
    async fn lanes_keep_only_the_newest_frame() {
        let (distributor, mut lanes) =
            FrameDistributor::new(RealtimeFlag::new(true), LatestFrame::default());
        let frames = futures_util::stream::iter((1..=5).map(frame));

        let stats = distributor.run(frames, CancellationToken::new()).await;
        assert_eq!(stats.frames, 5);

        assert_eq!(lanes.display.recv().await.map(|f| f.data[0]), Some(5));
        assert!(lanes.display.recv().await.is_none());
        assert_eq!(lanes.display.stats().dropped, 4);
        assert_eq!(lanes.analyze.recv().await.map(|f| f.data[0]), Some(5));
    }

    #[tokio::test]
    async fn cancellation_closes_lanes() {
        let (distributor, mut lanes) =
            FrameDistributor::new(RealtimeFlag::default(), LatestFrame::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = distributor
            .run(futures_util::stream::pending::<Frame>(), cancel)
            .await;
        assert_eq!(stats.frames, 0);
        assert!(lanes.display.recv().await.is_none());
        assert!(lanes.analyze.recv().await.is_none());
    }
}
