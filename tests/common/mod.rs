//! Common test utilities and helpers for the genai_cam tests
//!
//! Mock engines record what they are asked to do in a shared [`EventLog`]
//! so tests can check the order of model loads, unloads and generations.

#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use genai_cam::{
    core::frame::{Frame, RasterImage},
    error::{GenError, GenResult},
    generation::{
        PlaygroundStyle,
        diffusion::{
            DiffusionConfig, DiffusionEngine, DiffusionPipeline, DiffusionProgress, PipelineOptions,
        },
        style::StyleEngine,
    },
    inference::{DescriptionEngine, DescriptionInput, DescriptionModel, TokenControl, engine::SamplingParams},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered record of what the mocks did.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first event starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Wait until the watched value satisfies `predicate`, failing the test after
/// [`TIMEOUT`].
pub async fn wait_until<T: Clone>(
    rx: &mut watch::Receiver<T>,
    predicate: impl FnMut(&T) -> bool,
) -> T {
    tokio::time::timeout(TIMEOUT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state sender dropped")
        .clone()
}

pub fn test_image() -> RasterImage {
    RasterImage::solid(64, 48, [40, 80, 160, 255])
}

pub fn test_frame(tag: u8) -> Frame {
    RasterImage::solid(64, 48, [tag, tag, tag, 255]).to_frame()
}

/// Which prompt a description was produced for.
fn prompt_kind(prompt: &str) -> &'static str {
    if prompt.contains("brief") { "short" } else { "long" }
}

/// Description engine answering every prompt with fixed words, one token per
/// word.
#[derive(Clone)]
pub struct MockDescriptionEngine {
    pub log: EventLog,
    short_words: Vec<String>,
    long_words: Vec<String>,
    token_delay: Duration,
    load_delay: Duration,
    fail_generate: Option<String>,
    fail_load: Option<String>,
    loads: Arc<AtomicUsize>,
}

impl MockDescriptionEngine {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            short_words: words("A red bicycle"),
            long_words: words("A red bicycle leaning against a white brick wall in the sun"),
            token_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_generate: None,
            fail_load: None,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_answers(mut self, short: &str, long: &str) -> Self {
        self.short_words = words(short);
        self.long_words = words(long);
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_generation(mut self, reason: &str) -> Self {
        self.fail_generate = Some(reason.to_string());
        self
    }

    pub fn failing_load(mut self, reason: &str) -> Self {
        self.fail_load = Some(reason.to_string());
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

fn words(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

#[async_trait]
impl DescriptionEngine for MockDescriptionEngine {
    fn name(&self) -> &str {
        "mock-vlm"
    }

    async fn load(&self) -> GenResult<Arc<dyn DescriptionModel>> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if let Some(reason) = &self.fail_load {
            return Err(GenError::engine("description", reason.clone()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.log.push("model loaded");
        Ok(Arc::new(MockDescriptionModel {
            log: self.log.clone(),
            short_words: self.short_words.clone(),
            long_words: self.long_words.clone(),
            token_delay: self.token_delay,
            fail_generate: self.fail_generate.clone(),
            vocabulary: Mutex::new(Vec::new()),
        }))
    }
}

pub struct MockDescriptionModel {
    log: EventLog,
    short_words: Vec<String>,
    long_words: Vec<String>,
    token_delay: Duration,
    fail_generate: Option<String>,
    vocabulary: Mutex<Vec<String>>,
}

impl DescriptionModel for MockDescriptionModel {
    fn generate(
        &self,
        input: &DescriptionInput,
        _params: SamplingParams,
        cancel: &CancellationToken,
        on_token: &mut dyn FnMut(&[u32]) -> TokenControl,
    ) -> GenResult<String> {
        let kind = prompt_kind(&input.prompt);
        self.log.push(format!("generate {kind}"));
        if cancel.is_cancelled() {
            self.log.push(format!("cancelled {kind}"));
            return Err(GenError::cancelled("description"));
        }
        if let Some(reason) = &self.fail_generate {
            return Err(GenError::engine("description", reason.clone()));
        }

        let answer = if kind == "short" {
            &self.short_words
        } else {
            &self.long_words
        };
        *self.vocabulary.lock().unwrap() = answer.clone();

        let mut tokens = Vec::new();
        for index in 0..answer.len() {
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            tokens.push(index as u32);
            if on_token(&tokens) == TokenControl::Stop {
                break;
            }
        }
        self.log.push(format!("finished {kind}"));
        Ok(self.decode(&tokens))
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let vocabulary = self.vocabulary.lock().unwrap();
        tokens
            .iter()
            .filter_map(|t| vocabulary.get(*t as usize))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Drop for MockDescriptionModel {
    fn drop(&mut self) {
        self.log.push("model dropped");
    }
}

/// Diffusion engine producing a solid image after `steps` callbacks.
#[derive(Clone)]
pub struct MockDiffusionEngine {
    pub log: EventLog,
    model_exists: bool,
    available: bool,
    step_delay: Duration,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockDiffusionEngine {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            model_exists: true,
            available: true,
            step_delay: Duration::ZERO,
            prompts: Arc::default(),
        }
    }

    pub fn without_model(mut self) -> Self {
        self.model_exists = false;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Prompts the pipelines were run with.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl DiffusionEngine for MockDiffusionEngine {
    fn model_exists(&self) -> bool {
        self.model_exists
    }

    fn availability(&self) -> GenResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(GenError::unsupported("diffusion", "Stable Diffusion unavailable"))
        }
    }

    fn load_pipeline(&self, _options: PipelineOptions) -> GenResult<Arc<dyn DiffusionPipeline>> {
        self.log.push("load_pipeline");
        Ok(Arc::new(MockPipeline {
            log: self.log.clone(),
            step_delay: self.step_delay,
            prompts: Arc::clone(&self.prompts),
        }))
    }
}

struct MockPipeline {
    log: EventLog,
    step_delay: Duration,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl DiffusionPipeline for MockPipeline {
    fn generate(
        &self,
        config: &DiffusionConfig,
        progress: &mut dyn FnMut(DiffusionProgress) -> bool,
    ) -> GenResult<Option<RasterImage>> {
        self.prompts.lock().unwrap().push(config.prompt.clone());
        self.log.push("diffusion generate");
        for step in 0..config.steps {
            if !progress(DiffusionProgress {
                step,
                total: config.steps,
            }) {
                self.log.push("diffusion stopped");
                return Ok(None);
            }
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
        }
        Ok(Some(RasterImage::solid(32, 32, [255, 255, 255, 255])))
    }
}

/// Style engine that restyles into a solid image, optionally after a delay.
#[derive(Clone)]
pub struct MockStyleEngine {
    pub log: EventLog,
    available: bool,
    produces_image: bool,
    delay: Duration,
}

impl MockStyleEngine {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            available: true,
            produces_image: true,
            delay: Duration::ZERO,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn producing_nothing(mut self) -> Self {
        self.produces_image = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl StyleEngine for MockStyleEngine {
    fn availability(&self) -> GenResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(GenError::unsupported("image style", "Image Playground unavailable"))
        }
    }

    async fn generate(
        &self,
        _source: &RasterImage,
        style: PlaygroundStyle,
    ) -> GenResult<Option<RasterImage>> {
        self.log.push(format!("style {style:?}"));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .produces_image
            .then(|| RasterImage::solid(16, 16, [0, 0, 0, 255])))
    }
}
