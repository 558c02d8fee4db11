// # Capture Module
//
// Frame sources and the adapter that turns them into frame streams.

pub mod camera_feed;
pub mod source;
pub mod still_image;

pub use camera_feed::{CameraFeed, CameraFeedHandle};
pub use source::{FrameSource, frame_stream};
pub use still_image::StillImageSource;
