//! # Core Infrastructure Module
//!
//! Frame and image types shared by every stage, and the latest-wins buffer
//! that connects a live feed to its consumers.

pub mod frame;
pub mod latest_buffer;
