//! Prompt-driven image provider on top of a local diffusion engine.
//!
//! The engine itself (weights, scheduler, UNet) lives outside this crate and
//! is reached through [`DiffusionEngine`] and [`DiffusionPipeline`]. This
//! module decides when a pipeline is loaded, cached or dropped, maps the
//! engine's step callbacks to progress reports, and stops the engine when
//! the request is cancelled.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    core::frame::RasterImage,
    error::{GenError, GenResult},
    generation::{
        memory::MemoryPolicy,
        provider::{GenerationRequest, ImageProvider, ProgressFn, ProviderKind},
    },
};

pub const LOADING_STATUS: &str =
    "Loading Stable Diffusion pipeline. This may take a minute or so...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub reduce_memory: bool,
    pub disable_safety: bool,
}

impl PipelineOptions {
    pub fn for_policy(policy: &MemoryPolicy) -> Self {
        Self {
            reduce_memory: true,
            disable_safety: policy.is_low_memory(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffusionConfig {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance: f32,
    pub seed: u32,
    /// Image-to-image source; `None` starts from noise
    pub start_image: Option<RasterImage>,
    pub strength: f32,
}

/// One step callback from the engine. `step` is zero based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffusionProgress {
    pub step: u32,
    pub total: u32,
}

/// A loaded diffusion pipeline.
pub trait DiffusionPipeline: Send + Sync {
    /// Run the pipeline, blocking. `progress` returning `false` stops it, in
    /// which case the pipeline returns `Ok(None)`.
    fn generate(
        &self,
        config: &DiffusionConfig,
        progress: &mut dyn FnMut(DiffusionProgress) -> bool,
    ) -> GenResult<Option<RasterImage>>;
}

pub trait DiffusionEngine: Send + Sync {
    fn model_exists(&self) -> bool;

    fn availability(&self) -> GenResult<()> {
        Ok(())
    }

    /// Load pipeline resources into memory. Blocks.
    fn load_pipeline(&self, options: PipelineOptions) -> GenResult<Arc<dyn DiffusionPipeline>>;
}

/// Diffusion engine for builds without a local diffusion backend.
pub struct UnavailableDiffusionEngine;

impl DiffusionEngine for UnavailableDiffusionEngine {
    fn model_exists(&self) -> bool {
        false
    }

    fn availability(&self) -> GenResult<()> {
        Err(GenError::unsupported(
            "diffusion",
            "Stable Diffusion unavailable",
        ))
    }

    fn load_pipeline(&self, _options: PipelineOptions) -> GenResult<Arc<dyn DiffusionPipeline>> {
        Err(GenError::unsupported(
            "diffusion",
            "Stable Diffusion unavailable",
        ))
    }
}

pub struct DiffusionProvider {
    engine: Arc<dyn DiffusionEngine>,
    policy: MemoryPolicy,
    cached: Mutex<Option<Arc<dyn DiffusionPipeline>>>,
    /// Request id and token of the run that is on the blocking pool
    native: Mutex<Option<(u64, CancellationToken)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DiffusionProvider {
    pub fn new(engine: Arc<dyn DiffusionEngine>, policy: MemoryPolicy) -> Self {
        Self {
            engine,
            policy,
            cached: Mutex::new(None),
            native: Mutex::new(None),
        }
    }

    pub fn has_cached_pipeline(&self) -> bool {
        lock(&self.cached).is_some()
    }

    async fn pipeline(&self) -> GenResult<Arc<dyn DiffusionPipeline>> {
        let cached = lock(&self.cached).clone();
        if let Some(pipeline) = cached {
            debug!("Reusing cached diffusion pipeline");
            return Ok(pipeline);
        }

        let options = PipelineOptions::for_policy(&self.policy);
        info!(
            "Loading diffusion pipeline (reduce memory: {}, safety disabled: {})",
            options.reduce_memory, options.disable_safety
        );
        let engine = Arc::clone(&self.engine);
        let pipeline = tokio::task::spawn_blocking(move || engine.load_pipeline(options))
            .await
            .map_err(|e| GenError::engine("diffusion", format!("pipeline load task failed: {e}")))??;

        if self.policy.cache_pipeline() {
            *lock(&self.cached) = Some(Arc::clone(&pipeline));
        }
        Ok(pipeline)
    }
}

#[async_trait]
impl ImageProvider for DiffusionProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Diffusion
    }

    fn availability(&self) -> GenResult<()> {
        self.engine.availability()
    }

    fn requires_prompt(&self) -> bool {
        true
    }

    fn preparing_status(&self) -> String {
        LOADING_STATUS.to_string()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> GenResult<Option<RasterImage>> {
        let steps = request.steps.max(1);
        progress(-1, steps);
        let prompt = request
            .prompt
            .clone()
            .ok_or_else(|| GenError::config("prompt", "", "diffusion needs a prompt"))?;
        info!(
            "Diffusion requested: {} chars, {} steps, guidance {}",
            prompt.chars().count(),
            steps,
            request.guidance
        );

        if !self.engine.model_exists() {
            warn!("Diffusion model missing");
            return Err(GenError::model_missing("Stable Diffusion"));
        }

        let token = cancel.child_token();
        *lock(&self.native) = Some((request.id, token.clone()));

        let pipeline = self.pipeline().await?;
        if token.is_cancelled() {
            return Ok(None);
        }

        let config = DiffusionConfig {
            prompt,
            negative_prompt: request.negative_prompt.clone(),
            steps,
            guidance: request.guidance,
            seed: request.seed,
            start_image: request
                .start_mode
                .strength()
                .map(|_| request.source.clone()),
            strength: request.start_mode.strength().unwrap_or(1.0),
        };
        let run_token = token.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut last_step = None;
            pipeline.generate(&config, &mut |p| {
                if run_token.is_cancelled() {
                    return false;
                }
                if last_step != Some(p.step) {
                    last_step = Some(p.step);
                    let current = (p.step + 1).min(p.total);
                    debug!("Diffusion step {} of {}", current, p.total);
                    progress(i64::from(current), p.total);
                }
                true
            })
        })
        .await
        .map_err(|e| GenError::engine("diffusion", format!("generation task failed: {e}")))?;

        {
            let mut native = lock(&self.native);
            if native.as_ref().is_some_and(|(id, _)| *id == request.id) {
                *native = None;
            }
        }

        if token.is_cancelled() {
            debug!("Diffusion stopped by cancellation");
            return Ok(None);
        }
        match &result {
            Ok(Some(_)) => info!("Diffusion finished with an image"),
            Ok(None) => info!("Diffusion finished without an image"),
            Err(e) => warn!("Diffusion failed: {}", e),
        }
        result
    }

    fn cancel_native(&self) {
        if let Some((_, token)) = lock(&self.native).take() {
            debug!("Stopping native diffusion work");
            token.cancel();
        }
    }

    fn release_resources(&self) {
        if lock(&self.cached).take().is_some() {
            info!("Released cached diffusion pipeline");
        }
    }
}
