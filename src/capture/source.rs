// # Frame Sources
//
// A frame source is anything that yields BGRA frames on demand: a live camera
// feed, an image file replayed as a feed, a test fixture. `frame_stream`
// adapts one into a lazy stream that only pulls a frame when the consumer
// asks for one.

use anyhow::Result;
use async_trait::async_trait;
use cam_scale::presets::Size;
use futures_util::Stream;
use log::{debug, error, warn};

use crate::core::frame::Frame;

#[async_trait]
pub trait FrameSource: Send {
    /// Native resolution of the source.
    fn input_size(&self) -> Size;

    async fn initialize(&mut self) -> Result<()>;

    /// Next frame, or `None` once the source has ended.
    async fn next_frame(&mut self) -> Result<Option<Frame>>;

    async fn shutdown(&mut self) -> Result<()>;
}

enum StreamState {
    Idle(Box<dyn FrameSource>),
    Running(Box<dyn FrameSource>),
    Done,
}

/// Turn a source into a stream of frames.
///
/// The source is initialized on the first poll and shut down when it ends or
/// fails. A failing source ends the stream; the error is logged.
pub fn frame_stream(source: Box<dyn FrameSource>) -> impl Stream<Item = Frame> + Send {
    futures_util::stream::unfold(StreamState::Idle(source), |state| async move {
        let mut source = match state {
            StreamState::Done => return None,
            StreamState::Running(source) => source,
            StreamState::Idle(mut source) => {
                if let Err(e) = source.initialize().await {
                    error!("Frame source failed to initialize: {:#}", e);
                    return None;
                }
                debug!("Frame source initialized at {:?}", source.input_size());
                source
            }
        };

        match source.next_frame().await {
            Ok(Some(frame)) => Some((frame, StreamState::Running(source))),
            Ok(None) => {
                debug!("Frame source ended");
                close(source).await;
                None
            }
            Err(e) => {
                warn!("Frame source failed: {:#}", e);
                close(source).await;
                None
            }
        }
    })
}

async fn close(mut source: Box<dyn FrameSource>) {
    if let Err(e) = source.shutdown().await {
        warn!("Frame source shutdown failed: {:#}", e);
    }
}
