//! # Image Generation Module
//!
//! Reimagines the captured photo with one of two providers:
//!
//! - [`diffusion`]: a local diffusion model driven by the photo's description
//! - [`style`]: a platform image-style service working from the photo itself
//!
//! The [`orchestrator`] keeps at most one request in flight, publishes its
//! status, and applies the [`memory`] policy.

pub mod diffusion;
pub mod memory;
pub mod orchestrator;
pub mod provider;
pub mod style;

pub use memory::MemoryPolicy;
pub use orchestrator::{
    GenerationChoice, GenerationHandle, GenerationOption, GenerationOptions,
    GenerationOrchestrator, GenerationPhase, GenerationSnapshot,
};
pub use provider::{GenerationRequest, ImageProvider, PlaygroundStyle, ProviderKind};
