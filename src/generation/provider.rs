//! Image provider capability trait and the values a generation request is
//! built from.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    core::frame::RasterImage,
    error::GenResult,
};

/// Which engine produces the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Prompt-driven local diffusion model
    Diffusion,
    /// Platform image-style service working from the photo
    Style,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Diffusion, ProviderKind::Style];

    pub fn title(self) -> &'static str {
        match self {
            ProviderKind::Diffusion => "Stable Diffusion",
            ProviderKind::Style => "Image Playground",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ProviderKind::Diffusion => {
                "Generates images using the downloaded Stable Diffusion 2.1 model."
            }
            ProviderKind::Style => "Uses the platform image-style service when available.",
        }
    }

    pub fn other(self) -> ProviderKind {
        match self {
            ProviderKind::Diffusion => ProviderKind::Style,
            ProviderKind::Style => ProviderKind::Diffusion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StepPreset {
    Fast,
    Balanced,
    Quality,
}

impl StepPreset {
    pub const ALL: [StepPreset; 3] = [StepPreset::Fast, StepPreset::Balanced, StepPreset::Quality];

    pub fn steps(self) -> u32 {
        match self {
            StepPreset::Fast => 15,
            StepPreset::Balanced => 25,
            StepPreset::Quality => 35,
        }
    }

    /// Preset for a raw step count; unknown counts fall back to `Balanced`.
    pub fn from_steps(steps: u32) -> StepPreset {
        Self::ALL
            .into_iter()
            .find(|p| p.steps() == steps)
            .unwrap_or(StepPreset::Balanced)
    }

    pub fn label(self) -> &'static str {
        match self {
            StepPreset::Fast => "Fast (15 steps)",
            StepPreset::Balanced => "Balanced (25 steps)",
            StepPreset::Quality => "Quality (35 steps)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GuidancePreset {
    Low,
    Standard,
    High,
}

impl GuidancePreset {
    pub const ALL: [GuidancePreset; 3] = [
        GuidancePreset::Low,
        GuidancePreset::Standard,
        GuidancePreset::High,
    ];

    pub fn scale(self) -> f32 {
        match self {
            GuidancePreset::Low => 5.0,
            GuidancePreset::Standard => 7.5,
            GuidancePreset::High => 10.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GuidancePreset::Low => "Low guidance (5.0)",
            GuidancePreset::Standard => "Standard guidance (7.5)",
            GuidancePreset::High => "High guidance (10.0)",
        }
    }
}

pub const DEFAULT_PHOTO_STRENGTH: f32 = 0.75;

/// How the diffusion model initializes its latents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Random noise, a completely new image
    Noise,
    /// Image-to-image from the captured photo
    Photo { strength: f32 },
}

impl StartMode {
    pub fn photo() -> Self {
        StartMode::Photo {
            strength: DEFAULT_PHOTO_STRENGTH,
        }
    }

    /// Strength clamped to `0.0..=1.0`, `None` for noise.
    pub fn strength(self) -> Option<f32> {
        match self {
            StartMode::Noise => None,
            StartMode::Photo { strength } => Some(strength.clamp(0.0, 1.0)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StartMode::Noise => "Noise",
            StartMode::Photo { .. } => "Photo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PlaygroundStyle {
    Sketch,
    Illustration,
    Animation,
}

impl PlaygroundStyle {
    pub const ALL: [PlaygroundStyle; 3] = [
        PlaygroundStyle::Sketch,
        PlaygroundStyle::Illustration,
        PlaygroundStyle::Animation,
    ];

    pub fn title(self) -> &'static str {
        match self {
            PlaygroundStyle::Sketch => "Sketch",
            PlaygroundStyle::Illustration => "Illustration",
            PlaygroundStyle::Animation => "Animation",
        }
    }
}

/// Everything a provider needs for one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: u64,
    pub provider: ProviderKind,
    /// Set for prompt-driven providers once a description is available
    pub prompt: Option<String>,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance: f32,
    pub seed: u32,
    pub start_mode: StartMode,
    pub style: PlaygroundStyle,
    pub source: RasterImage,
}

/// Progress callback: `(step, total)`. A step of zero or less means the
/// pipeline is still loading.
pub type ProgressFn = Arc<dyn Fn(i64, u32) + Send + Sync>;

/// An engine that can turn a captured photo (and possibly a description) into
/// a new image.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// `Ok(())` when the provider can run on this device, otherwise an
    /// [`GenError::Unsupported`](crate::error::GenError::Unsupported) explaining why.
    fn availability(&self) -> GenResult<()>;

    /// Whether the provider needs a text prompt built from the description.
    fn requires_prompt(&self) -> bool;

    /// Status shown between dispatch and the first progress report.
    fn preparing_status(&self) -> String {
        "Preparing...".to_string()
    }

    /// Run one generation.
    ///
    /// `Ok(None)` means the engine stopped without an image, usually because
    /// `cancel` fired.
    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> GenResult<Option<RasterImage>>;

    /// Abandon any native work still running for a previous request.
    fn cancel_native(&self) {}

    /// Drop cached pipelines and other large resources.
    fn release_resources(&self) {}
}
