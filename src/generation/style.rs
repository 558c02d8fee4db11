//! Image provider backed by a platform image-style service.
//!
//! The service restyles the captured photo directly; it does not need a
//! description.

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    core::frame::RasterImage,
    error::{GenError, GenResult},
    generation::provider::{
        GenerationRequest, ImageProvider, PlaygroundStyle, ProgressFn, ProviderKind,
    },
};

#[async_trait]
pub trait StyleEngine: Send + Sync {
    /// `Ok(())` when the service exists on this device.
    fn availability(&self) -> GenResult<()>;

    /// Restyle `source`. `Ok(None)` when the service produced nothing.
    async fn generate(
        &self,
        source: &RasterImage,
        style: PlaygroundStyle,
    ) -> GenResult<Option<RasterImage>>;
}

/// Style engine for platforms without an image-style service.
pub struct UnavailableStyleEngine {
    reason: String,
}

impl UnavailableStyleEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for UnavailableStyleEngine {
    fn default() -> Self {
        Self::new("Image Playground unavailable")
    }
}

#[async_trait]
impl StyleEngine for UnavailableStyleEngine {
    fn availability(&self) -> GenResult<()> {
        Err(GenError::unsupported("image style", self.reason.clone()))
    }

    async fn generate(
        &self,
        _source: &RasterImage,
        _style: PlaygroundStyle,
    ) -> GenResult<Option<RasterImage>> {
        Err(GenError::unsupported("image style", self.reason.clone()))
    }
}

pub struct StyleProvider {
    engine: Arc<dyn StyleEngine>,
}

impl StyleProvider {
    pub fn new(engine: Arc<dyn StyleEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ImageProvider for StyleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Style
    }

    fn availability(&self) -> GenResult<()> {
        self.engine.availability()
    }

    fn requires_prompt(&self) -> bool {
        false
    }

    fn preparing_status(&self) -> String {
        "Preparing Image Playground...".to_string()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _progress: ProgressFn,
        cancel: CancellationToken,
    ) -> GenResult<Option<RasterImage>> {
        info!("Invoking image style service with style {}", request.style.title());
        let result = tokio::select! {
            result = self.engine.generate(&request.source, request.style) => result,
            _ = cancel.cancelled() => return Err(GenError::cancelled("image style")),
        };
        match result {
            Ok(Some(image)) => Ok(Some(image)),
            Ok(None) => {
                warn!("Image style service returned nothing");
                Err(GenError::no_image("Image Playground"))
            }
            Err(e) => Err(e),
        }
    }
}
