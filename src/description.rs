//! # Description Pipeline
//!
//! Describes a captured photo twice: a short caption first, then a long,
//! detailed description. The long pass never starts before the short one has
//! been published, and once it is stored the live preview (`current`) goes
//! back to the short caption.

use std::sync::Arc;

use log::info;
use tokio::sync::watch;

use crate::{
    config::{DescriptionMode, StudioConfig},
    core::frame::RasterImage,
    inference::{DescriptionInput, InferenceSession},
};

/// Published description texts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionState {
    pub short: String,
    pub long: String,
    /// What a preview should show right now
    pub current: String,
}

impl DescriptionState {
    pub fn has_any(&self) -> bool {
        !self.short.trim().is_empty() || !self.long.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionPair {
    pub short: String,
    pub long: String,
}

#[derive(Clone)]
pub struct DescriptionPipeline {
    session: InferenceSession,
    short_prompt: String,
    long_prompt: String,
    state: Arc<watch::Sender<DescriptionState>>,
}

impl DescriptionPipeline {
    pub fn new(session: InferenceSession, config: &StudioConfig) -> Self {
        let (state, _) = watch::channel(DescriptionState::default());
        Self {
            session,
            short_prompt: config.prompt_for(DescriptionMode::Short),
            long_prompt: config.prompt_for(DescriptionMode::Long),
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DescriptionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> DescriptionState {
        self.state.borrow().clone()
    }

    /// Clear all descriptions and run the short prompt. Returns the caption.
    pub async fn describe_short(&self, image: RasterImage) -> String {
        info!("Starting short image description");
        self.session.clear_output();
        self.state.send_replace(DescriptionState::default());

        let text = self.run(&self.short_prompt, image).await;
        self.state.send_modify(|s| {
            s.short = text.clone();
            s.current = text.clone();
        });
        info!("Short description ready ({} chars)", text.chars().count());
        text
    }

    /// Run the long prompt and store the result. Runs the short pass first if
    /// no caption has been published yet.
    pub async fn describe_long(&self, image: RasterImage) -> String {
        if self.state.borrow().short.is_empty() {
            self.describe_short(image.clone()).await;
        }

        info!("Starting long image description");
        let text = self.run(&self.long_prompt, image).await;
        self.state.send_modify(|s| {
            s.long = text.clone();
            s.current = s.short.clone();
        });
        info!("Long description ready ({} chars)", text.chars().count());
        text
    }

    /// Short then long, strictly one after the other.
    pub async fn describe(&self, image: RasterImage) -> DescriptionPair {
        let short = self.describe_short(image.clone()).await;
        let long = self.describe_long(image).await;
        DescriptionPair { short, long }
    }

    pub fn clear(&self) {
        self.state.send_replace(DescriptionState::default());
    }

    async fn run(&self, prompt: &str, image: RasterImage) -> String {
        let handle = self
            .session
            .generate(DescriptionInput::new(prompt, image), true);
        handle.wait().await.unwrap_or_default()
    }
}
