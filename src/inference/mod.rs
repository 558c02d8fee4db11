//! # Inference Module
//!
//! The vision-language model contract ([`engine`]), its asset provider
//! ([`assets`]), an HTTP-backed engine ([`http`]), and the session that owns
//! the loaded model ([`session`]).

pub mod assets;
pub mod engine;
pub mod http;
pub mod session;

pub use assets::{LocalModelDirectory, ModelAssets};
pub use engine::{DescriptionEngine, DescriptionInput, DescriptionModel, TokenControl};
pub use session::{
    EvaluationState, InferenceHandle, InferenceParams, InferenceSession, SessionSnapshot,
};
