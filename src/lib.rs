//! # GenAI Camera
//!
//! Live camera analysis with a vision-language model, and generative
//! reimagining of captured photos.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - `capture`: Frame sources (pushed camera frames, still images)
//! - `processing`: Fan-out of frames to the preview and the analysis loop
//! - `core`: Frames, raster images and the latest-wins buffer
//! - `config`: Studio configuration and persisted generation settings
//! - `inference`: The vision-language model session (single flight, lazy load)
//! - `description`: Short and long photo descriptions
//! - `generation`: Diffusion and style providers behind one orchestrator
//! - `live`: Real-time description of incoming frames
//! - `session`: High-level session wiring everything together
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use genai_cam::capture::StillImageSource;
//! use genai_cam::inference::http::{HttpDescriptionEngine, HttpEngineConfig};
//! use genai_cam::session::CameraSession;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(HttpDescriptionEngine::new(HttpEngineConfig::default()));
//! let session = CameraSession::builder(engine).build()?;
//! session
//!     .start(Box::new(StillImageSource::open("photo.png")?))
//!     .await?;
//!
//! tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//! if session.capture().await {
//!     session.wait_for_photo_flow().await;
//!     println!("{}", session.descriptions().snapshot().long);
//! }
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod core;
pub mod description;
pub mod error;
pub mod generation;
pub mod inference;
pub mod live;
pub mod processing;
pub mod session;

/// Re-export error types for convenience
pub use error::{ErrorSeverity, GenError, GenResult, HasRecoverySuggestion, HasSeverity};

pub use session::{CameraSession, CameraSessionBuilder};
