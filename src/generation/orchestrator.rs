//! # Generation Orchestrator
//!
//! Turns the captured photo (and its description) into a generated image.
//!
//! ```text
//! Idle ──start──▶ Preparing ──progress──▶ Generating ──▶ Completed
//!   ▲                │  │                      │    └──▶ Failed
//!   │                │  └── no description ──▶ Deferred ──resume_deferred──▶ Preparing
//!   └── cancel ◀─────┴─────────────────────────┴──▶ Cancelled
//! ```
//!
//! At most one request is active. Starting a new one cancels the old one,
//! and results of a superseded request are never published: every publish
//! happens under the `active` lock after checking the request id.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use log::{debug, error, info, log, warn};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::settings::{GenerationSettings, SettingsStore},
    core::frame::RasterImage,
    description::DescriptionState,
    error::{GenError, GenResult, HasRecoverySuggestion, HasSeverity},
    generation::{
        diffusion::LOADING_STATUS,
        memory::MemoryPolicy,
        provider::{
            GenerationRequest, GuidancePreset, ImageProvider, PlaygroundStyle, ProgressFn,
            ProviderKind, StartMode, StepPreset,
        },
    },
    inference::{InferenceSession, engine::clock_seed},
};

pub const WAITING_STATUS: &str = "Waiting for image description...";
pub const CANCELED_STATUS: &str = "Generation canceled";
pub const FAILED_STATUS: &str = "Generation failed";
pub const MISSING_MODEL_STATUS: &str = "Download Stable Diffusion from the setup screen";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GenerationPhase {
    #[default]
    Idle,
    Preparing,
    Generating,
    Completed,
    Failed,
    Cancelled,
    /// Waiting for a description before a prompt-driven provider can run
    Deferred,
}

/// Everything the orchestrator publishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationSnapshot {
    /// User-facing status, `None` when there is nothing to say
    pub status: Option<String>,
    pub image: Option<RasterImage>,
    pub is_generating: bool,
    pub phase: GenerationPhase,
    pub provider: Option<ProviderKind>,
    pub request_id: u64,
}

/// Per-request overrides. Unset fields come from the stored settings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationOptions {
    /// Selecting a provider also stores it as the new default
    pub provider: Option<ProviderKind>,
    pub style: Option<PlaygroundStyle>,
}

impl GenerationOptions {
    pub fn with_style(style: PlaygroundStyle) -> Self {
        Self {
            style: Some(style),
            ..Self::default()
        }
    }
}

/// One entry of the generation context menu.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOption {
    pub id: String,
    pub title: String,
    pub selected: bool,
    pub enabled: bool,
    pub choice: GenerationChoice,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GenerationChoice {
    Provider(ProviderKind),
    Style(PlaygroundStyle),
    Steps(StepPreset),
    Guidance(GuidancePreset),
    Start(StartMode),
}

/// Handle to a started request.
#[derive(Debug)]
pub struct GenerationHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl GenerationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the request reached a terminal state (or was superseded).
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Generation task {} failed: {}", self.id, e);
        }
    }
}

/// Status text for a progress report. A step of zero or less means the
/// pipeline is still loading.
pub fn progress_status(step: i64, total: u32) -> String {
    let total = total.max(1);
    if step <= 0 {
        LOADING_STATUS.to_string()
    } else {
        let current = step.clamp(1, i64::from(total));
        format!("Step {current} of {total}")
    }
}

/// Diffusion prompt: the long description if there is one, else the short
/// one, followed by the user suffix. `None` when both descriptions are blank.
pub fn build_prompt(long: &str, short: &str, suffix: &str) -> Option<String> {
    let long = long.trim();
    let short = short.trim();
    let base = if !long.is_empty() {
        long
    } else if !short.is_empty() {
        short
    } else {
        return None;
    };
    let suffix = suffix.trim();
    if suffix.is_empty() {
        Some(base.to_string())
    } else {
        Some(format!("{base} {suffix}"))
    }
}

struct Active {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    diffusion: Arc<dyn ImageProvider>,
    style: Arc<dyn ImageProvider>,
    settings: Arc<dyn SettingsStore>,
    policy: MemoryPolicy,
    inference: Option<InferenceSession>,
    descriptions: watch::Receiver<DescriptionState>,
    source: Mutex<Option<RasterImage>>,
    active: Mutex<Option<Active>>,
    deferred: Mutex<Option<GenerationOptions>>,
    next_id: AtomicU64,
    state: watch::Sender<GenerationSnapshot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct GenerationOrchestrator {
    inner: Arc<Inner>,
}

impl GenerationOrchestrator {
    /// `inference` is unloaded before diffusion runs when `policy` says the
    /// device is short on memory.
    pub fn new(
        diffusion: Arc<dyn ImageProvider>,
        style: Arc<dyn ImageProvider>,
        settings: Arc<dyn SettingsStore>,
        descriptions: watch::Receiver<DescriptionState>,
        policy: MemoryPolicy,
        inference: Option<InferenceSession>,
    ) -> Self {
        let (state, _) = watch::channel(GenerationSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                diffusion,
                style,
                settings,
                policy,
                inference,
                descriptions,
                source: Mutex::new(None),
                active: Mutex::new(None),
                deferred: Mutex::new(None),
                next_id: AtomicU64::new(0),
                state,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> GenerationSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn is_generating(&self) -> bool {
        self.inner.state.borrow().is_generating
    }

    pub fn is_deferred(&self) -> bool {
        lock(&self.inner.deferred).is_some()
    }

    pub fn memory_policy(&self) -> MemoryPolicy {
        self.inner.policy
    }

    pub fn settings(&self) -> GenerationSettings {
        self.inner.settings.load()
    }

    /// Provider a request with default options would run on: the stored
    /// selection, or the other provider when the selection cannot run.
    pub fn effective_provider(&self) -> Option<ProviderKind> {
        let selected = self.inner.settings.load().provider;
        self.inner.available_provider(selected).ok()
    }

    /// Photo that generations start from.
    pub fn set_source_image(&self, image: Option<RasterImage>) {
        *lock(&self.inner.source) = image;
    }

    pub fn source_image(&self) -> Option<RasterImage> {
        lock(&self.inner.source).clone()
    }

    /// Publish a status ahead of a request, e.g. while the photo is being
    /// described.
    pub fn set_status(&self, status: Option<String>) {
        self.inner.state.send_modify(|s| s.status = status);
    }

    /// Forget the generated image and status.
    pub fn clear_output(&self) {
        self.inner.state.send_modify(|s| {
            s.image = None;
            s.status = None;
            s.phase = GenerationPhase::Idle;
        });
    }

    /// Start a new request, cancelling the one in flight.
    ///
    /// Returns `None` when there is no captured photo or no provider can run.
    pub fn start_generation(&self, options: GenerationOptions) -> Option<GenerationHandle> {
        let inner = &self.inner;
        let Some(source) = self.source_image() else {
            debug!("No captured image, nothing to generate");
            return None;
        };

        inner.abandon_active();
        lock(&inner.deferred).take();

        let mut settings = inner.settings.load();
        if let Some(kind) = options.provider.filter(|k| *k != settings.provider) {
            settings.provider = kind;
            inner.persist(&settings);
        }
        let kind = match inner.resolve_provider(&mut settings) {
            Ok(kind) => kind,
            Err(reason) => {
                warn!("No image provider available: {}", reason);
                inner.state.send_modify(|s| {
                    s.status = Some(reason);
                    s.image = None;
                    s.is_generating = false;
                    s.phase = GenerationPhase::Failed;
                });
                return None;
            }
        };
        let provider = Arc::clone(inner.provider(kind));

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = GenerationRequest {
            id,
            provider: kind,
            prompt: None,
            negative_prompt: settings.negative_prompt.clone(),
            steps: settings.steps.steps(),
            guidance: settings.guidance.scale(),
            seed: clock_seed() as u32,
            start_mode: settings.start_mode,
            style: options.style.unwrap_or(settings.style),
            source,
        };
        let cancel = CancellationToken::new();
        {
            let mut active = lock(&inner.active);
            *active = Some(Active {
                id,
                cancel: cancel.clone(),
            });
            let status = provider.preparing_status();
            inner.state.send_modify(|s| {
                s.status = Some(status);
                s.image = None;
                s.is_generating = true;
                s.phase = GenerationPhase::Preparing;
                s.provider = Some(kind);
                s.request_id = id;
            });
        }
        info!("Starting generation {} using {}", id, kind.title());

        let task = tokio::spawn(run(Arc::clone(inner), provider, request, options, cancel));
        Some(GenerationHandle { id, task })
    }

    /// Re-issue a request that was waiting for a description. Does nothing
    /// when no request is waiting; a waiting request is re-issued once.
    pub fn resume_deferred(&self) -> Option<GenerationHandle> {
        let options = lock(&self.inner.deferred).take()?;
        info!("Description available, resuming deferred generation");
        self.start_generation(options)
    }

    /// Cancel whatever is in flight. Safe to call when idle.
    pub fn cancel_generation(&self) {
        let active = lock(&self.inner.active).take();
        let deferred = lock(&self.inner.deferred).take();
        self.inner.cancel_native();
        if let Some(active) = &active {
            info!("Cancelling generation {}", active.id);
            active.cancel.cancel();
        }
        let in_flight = active.is_some() || deferred.is_some();
        self.inner.state.send_modify(|s| {
            if in_flight {
                s.status = None;
                s.phase = GenerationPhase::Cancelled;
            }
            s.is_generating = false;
        });
    }

    /// Cancel in-flight work and release every provider's pipeline.
    pub fn handle_memory_warning(&self) {
        warn!("Memory warning, releasing image generation resources");
        self.cancel_generation();
        self.inner.diffusion.release_resources();
        self.inner.style.release_resources();
    }

    /// Entries of the generation context menu for the current settings.
    pub fn generation_options(&self) -> Vec<GenerationOption> {
        let settings = self.inner.settings.load();
        let mut items: Vec<GenerationOption> = ProviderKind::ALL
            .into_iter()
            .map(|kind| GenerationOption {
                id: format!("provider-{kind:?}").to_lowercase(),
                title: kind.title().to_string(),
                selected: kind == settings.provider,
                enabled: self.inner.provider(kind).availability().is_ok(),
                choice: GenerationChoice::Provider(kind),
            })
            .collect();

        match settings.provider {
            ProviderKind::Style => {
                items.extend(PlaygroundStyle::ALL.into_iter().map(|style| GenerationOption {
                    id: format!("style-{style:?}").to_lowercase(),
                    title: style.title().to_string(),
                    selected: style == settings.style,
                    enabled: true,
                    choice: GenerationChoice::Style(style),
                }));
            }
            ProviderKind::Diffusion => {
                items.extend(StepPreset::ALL.into_iter().map(|preset| GenerationOption {
                    id: format!("steps-{}", preset.steps()),
                    title: preset.label().to_string(),
                    selected: preset == settings.steps,
                    enabled: true,
                    choice: GenerationChoice::Steps(preset),
                }));
                items.extend(GuidancePreset::ALL.into_iter().map(|preset| GenerationOption {
                    id: format!("guidance-{}", preset.scale()),
                    title: preset.label().to_string(),
                    selected: preset == settings.guidance,
                    enabled: true,
                    choice: GenerationChoice::Guidance(preset),
                }));
                items.extend([StartMode::Noise, StartMode::photo()].into_iter().map(|mode| {
                    GenerationOption {
                        id: format!("start-{}", mode.label()).to_lowercase(),
                        title: mode.label().to_string(),
                        selected: mode.label() == settings.start_mode.label(),
                        enabled: true,
                        choice: GenerationChoice::Start(mode),
                    }
                }));
            }
        }
        items
    }

    /// Store a menu choice and regenerate with it. Disabled providers are
    /// ignored.
    pub fn apply_option(&self, choice: GenerationChoice) -> GenResult<Option<GenerationHandle>> {
        let mut options = GenerationOptions::default();
        match choice {
            GenerationChoice::Provider(kind) => {
                if self.inner.provider(kind).availability().is_err() {
                    debug!("Ignoring selection of unavailable provider {:?}", kind);
                    return Ok(None);
                }
                options.provider = Some(kind);
            }
            GenerationChoice::Style(style) => {
                self.inner.settings.update(|s| s.style = style)?;
                options.style = Some(style);
            }
            GenerationChoice::Steps(preset) => {
                self.inner.settings.update(|s| s.steps = preset)?;
            }
            GenerationChoice::Guidance(preset) => {
                self.inner.settings.update(|s| s.guidance = preset)?;
            }
            GenerationChoice::Start(mode) => {
                self.inner.settings.update(|s| s.start_mode = mode)?;
            }
        }
        Ok(self.start_generation(options))
    }
}

impl Inner {
    fn provider(&self, kind: ProviderKind) -> &Arc<dyn ImageProvider> {
        match kind {
            ProviderKind::Diffusion => &self.diffusion,
            ProviderKind::Style => &self.style,
        }
    }

    fn cancel_native(&self) {
        self.diffusion.cancel_native();
        self.style.cancel_native();
    }

    fn abandon_active(&self) {
        if let Some(active) = lock(&self.active).take() {
            debug!("Superseding generation {}", active.id);
            active.cancel.cancel();
        }
        self.cancel_native();
    }

    fn persist(&self, settings: &GenerationSettings) {
        if let Err(e) = self.settings.save(settings) {
            warn!("Could not store generation settings: {}", e);
        }
    }

    /// `selected` if it can run, else the other provider. The error is the
    /// reason `selected` cannot run.
    fn available_provider(&self, selected: ProviderKind) -> Result<ProviderKind, String> {
        let reason = match self.provider(selected).availability() {
            Ok(()) => return Ok(selected),
            Err(e) => e.to_string(),
        };
        let other = selected.other();
        match self.provider(other).availability() {
            Ok(()) => {
                debug!("{} unavailable: {}", selected.title(), reason);
                Ok(other)
            }
            Err(_) => Err(reason),
        }
    }

    /// Like [`Inner::available_provider`], storing a fallback as the new
    /// selection.
    fn resolve_provider(&self, settings: &mut GenerationSettings) -> Result<ProviderKind, String> {
        let selected = settings.provider;
        let kind = self.available_provider(selected)?;
        if kind != selected {
            warn!(
                "{} selected while unavailable, falling back to {}",
                selected.title(),
                kind.title()
            );
            settings.provider = kind;
            self.persist(settings);
        }
        Ok(kind)
    }

    fn is_current(active: &Option<Active>, id: u64) -> bool {
        active.as_ref().is_some_and(|a| a.id == id)
    }

    fn defer(&self, id: u64, options: GenerationOptions) {
        let mut active = lock(&self.active);
        if !Self::is_current(&active, id) {
            return;
        }
        *active = None;
        *lock(&self.deferred) = Some(options);
        info!("Generation {} postponed until a description is available", id);
        self.state.send_modify(|s| {
            s.status = Some(WAITING_STATUS.to_string());
            s.is_generating = false;
            s.phase = GenerationPhase::Deferred;
        });
    }

    fn report_progress(&self, id: u64, step: i64, total: u32) {
        let active = lock(&self.active);
        if !Self::is_current(&active, id) {
            return;
        }
        let status = progress_status(step, total);
        self.state.send_modify(|s| {
            s.status = Some(status);
            if step > 0 {
                s.phase = GenerationPhase::Generating;
            }
        });
    }

    fn finish(&self, id: u64, result: GenResult<Option<RasterImage>>) {
        let mut active = lock(&self.active);
        if !Self::is_current(&active, id) {
            debug!("Generation {} was superseded, dropping its result", id);
            return;
        }
        *active = None;

        let (image, status, phase) = match result {
            Ok(Some(image)) => (Some(image), None, GenerationPhase::Completed),
            Ok(None) => (
                None,
                Some(CANCELED_STATUS.to_string()),
                GenerationPhase::Cancelled,
            ),
            Err(e) => {
                log!(e.severity().log_level(), "Generation {} failed: {}", id, e);
                let status = failure_status(&e);
                let phase = if e.is_cancellation() {
                    GenerationPhase::Cancelled
                } else {
                    GenerationPhase::Failed
                };
                (None, Some(status), phase)
            }
        };
        info!("Generation {} finished: {:?}", id, phase);
        self.state.send_modify(|s| {
            s.image = image;
            s.status = status;
            s.phase = phase;
            s.is_generating = false;
        });
    }
}

fn failure_status(error: &GenError) -> String {
    match error {
        GenError::Cancelled { .. } => CANCELED_STATUS.to_string(),
        GenError::ModelMissing { .. } => error
            .recovery_suggestion()
            .unwrap_or(MISSING_MODEL_STATUS)
            .to_string(),
        GenError::Unsupported { .. } => error.to_string(),
        GenError::NoImage { .. } => FAILED_STATUS.to_string(),
        other => format!("{FAILED_STATUS}: {other}"),
    }
}

async fn run(
    inner: Arc<Inner>,
    provider: Arc<dyn ImageProvider>,
    mut request: GenerationRequest,
    options: GenerationOptions,
    cancel: CancellationToken,
) {
    let id = request.id;
    if provider.requires_prompt() {
        let descriptions = inner.descriptions.borrow().clone();
        let suffix = inner.settings.load().prompt_suffix;
        match build_prompt(&descriptions.long, &descriptions.short, &suffix) {
            Some(prompt) => {
                debug!("Generation {} prompt: {} chars", id, prompt.chars().count());
                request.prompt = Some(prompt);
            }
            None => {
                inner.defer(id, options);
                return;
            }
        }
    }

    if request.provider == ProviderKind::Diffusion && inner.policy.unload_description_model() {
        if let Some(session) = &inner.inference {
            session
                .unload_for_memory_pressure("Preparing Stable Diffusion generation", false)
                .await;
        }
    }
    if cancel.is_cancelled() {
        return;
    }

    let progress: ProgressFn = {
        let inner = Arc::clone(&inner);
        Arc::new(move |step, total| inner.report_progress(id, step, total))
    };
    let result = tokio::select! {
        result = provider.generate(&request, progress, cancel.clone()) => result,
        _ = cancel.cancelled() => Err(GenError::cancelled("image generation")),
    };
    inner.finish(id, result);
}
