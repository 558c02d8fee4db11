//! Contract between the inference session and a vision-language model.
//!
//! An engine loads a model once; the model then produces text for
//! `{images, prompt}` one token at a time, asking the caller after every token
//! whether to continue.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{core::frame::RasterImage, error::GenResult};

/// What the model is asked to describe.
#[derive(Debug, Clone)]
pub struct DescriptionInput {
    pub prompt: String,
    pub images: Vec<RasterImage>,
}

impl DescriptionInput {
    pub fn new(prompt: impl Into<String>, image: RasterImage) -> Self {
        Self {
            prompt: prompt.into(),
            images: vec![image],
        }
    }
}

/// Answer of the per-token callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenControl {
    More,
    Stop,
}

/// Sampling parameters passed with every generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub seed: u64,
}

/// A loaded description model.
///
/// `generate` blocks the calling thread; the session runs it on the blocking
/// pool.
pub trait DescriptionModel: Send + Sync {
    /// Generate a description. `on_token` is called with every token produced
    /// so far; returning [`TokenControl::Stop`] ends generation early and the
    /// text decoded up to that point is returned.
    ///
    /// Work that does not yield tokens (a network round trip, prompt
    /// evaluation) must watch `cancel` and return
    /// [`GenError::Cancelled`](crate::error::GenError::Cancelled) once it fires.
    fn generate(
        &self,
        input: &DescriptionInput,
        params: SamplingParams,
        cancel: &CancellationToken,
        on_token: &mut dyn FnMut(&[u32]) -> TokenControl,
    ) -> GenResult<String>;

    /// Decode tokens produced by this model.
    fn decode(&self, tokens: &[u32]) -> String;
}

#[async_trait]
pub trait DescriptionEngine: Send + Sync {
    /// Human readable model name, used in status text.
    fn name(&self) -> &str;

    async fn load(&self) -> GenResult<Arc<dyn DescriptionModel>>;
}

/// Seed derived from the wall clock, so every run samples something new.
pub fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
