//! # Processing Module
//!
//! Frame fan-out from the camera to the display and analysis consumers.

pub mod distributor;

pub use distributor::{DistributorStats, FrameDistributor, FrameLanes, LatestFrame, RealtimeFlag};
