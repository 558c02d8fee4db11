//! # Inference Session
//!
//! Owns the one description model of the process and serializes access to it.
//!
//! ## Behaviour
//!
//! - **Lazy load**: the model is loaded by the first `generate` (or an explicit
//!   [`InferenceSession::load`]). Concurrent callers wait for the same load.
//! - **Single flight**: while a generation runs, `generate` hands back the
//!   running operation instead of starting or queueing another one.
//! - **Cooperative cancellation**: [`InferenceSession::cancel`] fires a token
//!   that is checked between tokens. A cancelled run never publishes output.
//! - **Memory pressure**: [`InferenceSession::unload_for_memory_pressure`]
//!   cancels in-flight work and drops the model; the next `generate` reloads.
//!
//! Observable state is published through a `watch` channel of
//! [`SessionSnapshot`]; the session is its only writer.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use log::{debug, error, info, log};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::StudioConfig,
    error::{GenError, GenResult, HasSeverity},
    inference::{
        assets::ModelAssets,
        engine::{
            DescriptionEngine, DescriptionInput, DescriptionModel, SamplingParams, TokenControl,
            clock_seed,
        },
    },
};

/// Coarse progress of the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvaluationState {
    #[default]
    Idle,
    ProcessingPrompt,
    GeneratingResponse,
}

impl EvaluationState {
    pub fn label(self) -> &'static str {
        match self {
            EvaluationState::Idle => "Idle",
            EvaluationState::ProcessingPrompt => "Processing Prompt",
            EvaluationState::GeneratingResponse => "Generating Response",
        }
    }
}

/// Everything the session publishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub running: bool,
    /// Generated text, partial while streaming
    pub output: String,
    /// Time to first token of the last generation
    pub prompt_time: Option<Duration>,
    /// Load, download and error status
    pub model_info: String,
    pub evaluation: EvaluationState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub max_tokens: usize,
    pub display_every_n_tokens: usize,
    pub temperature: f32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self::from(&StudioConfig::default())
    }
}

impl From<&StudioConfig> for InferenceParams {
    fn from(config: &StudioConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            display_every_n_tokens: config.display_every_n_tokens.max(1),
            temperature: 0.0,
        }
    }
}

pub enum LoadState {
    Unloaded,
    Loaded(Arc<dyn DescriptionModel>),
}

type Completion = Shared<BoxFuture<'static, Option<String>>>;

/// A running (or finished) generation. Clones refer to the same operation.
#[derive(Clone)]
pub struct InferenceHandle {
    id: u64,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    done: Completion,
}

impl InferenceHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the generation has finished publishing. Returns the text
    /// this generation produced, `None` if it was cancelled.
    pub async fn wait(&self) -> Option<String> {
        self.done.clone().await
    }
}

impl std::fmt::Debug for InferenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct Inner {
    engine: Arc<dyn DescriptionEngine>,
    assets: Option<Arc<dyn ModelAssets>>,
    params: InferenceParams,
    load: tokio::sync::Mutex<LoadState>,
    current: Mutex<Option<InferenceHandle>>,
    next_id: AtomicU64,
    loads: AtomicU64,
    state: watch::Sender<SessionSnapshot>,
}

/// Cheap to clone; all clones share one model.
#[derive(Clone)]
pub struct InferenceSession {
    inner: Arc<Inner>,
}

impl InferenceSession {
    pub fn new(engine: Arc<dyn DescriptionEngine>, params: InferenceParams) -> Self {
        Self::build(engine, None, params)
    }

    /// Consult `assets` before loading; missing models are downloaded first.
    pub fn with_assets(
        engine: Arc<dyn DescriptionEngine>,
        assets: Arc<dyn ModelAssets>,
        params: InferenceParams,
    ) -> Self {
        Self::build(engine, Some(assets), params)
    }

    fn build(
        engine: Arc<dyn DescriptionEngine>,
        assets: Option<Arc<dyn ModelAssets>>,
        params: InferenceParams,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                engine,
                assets,
                params,
                load: tokio::sync::Mutex::new(LoadState::Unloaded),
                current: Mutex::new(None),
                next_id: AtomicU64::new(0),
                loads: AtomicU64::new(0),
                state,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn output(&self) -> String {
        self.inner.state.borrow().output.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().running
    }

    /// Number of times the model was loaded.
    pub fn load_count(&self) -> u64 {
        self.inner.loads.load(Ordering::Relaxed)
    }

    pub async fn is_loaded(&self) -> bool {
        matches!(*self.inner.load.lock().await, LoadState::Loaded(_))
    }

    pub fn clear_output(&self) {
        self.inner.state.send_modify(|s| s.output.clear());
    }

    /// Load the model ahead of the first generation. Failures are reported in
    /// `model_info`.
    pub async fn load(&self) {
        if let Err(e) = self.inner.ensure_loaded().await {
            error!("Description model failed to load: {}", e);
            self.inner
                .state
                .send_modify(|s| s.model_info = format!("Error loading model: {e}"));
        }
    }

    /// Start describing `input`, or join the generation already running.
    ///
    /// With `stream` the partial text is published on the first token and
    /// then every `display_every_n_tokens` tokens; otherwise only the final
    /// text is published.
    pub fn generate(&self, input: DescriptionInput, stream: bool) -> InferenceHandle {
        let mut current = self.inner.lock_current();
        if let Some(handle) = current.as_ref().filter(|h| !h.is_finished()) {
            debug!("Generation {} already running, joining it", handle.id);
            return handle.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        self.inner.state.send_modify(|s| {
            s.running = true;
            s.evaluation = EvaluationState::ProcessingPrompt;
        });
        debug!("Starting generation {} (stream: {})", id, stream);

        let task = tokio::spawn(run(
            Arc::clone(&self.inner),
            id,
            input,
            stream,
            cancel.clone(),
            Arc::clone(&finished),
        ));
        let done = async move {
            task.await.unwrap_or_else(|e| {
                error!("Generation task {} panicked: {}", id, e);
                None
            })
        }
        .boxed()
        .shared();

        let handle = InferenceHandle {
            id,
            cancel,
            finished,
            done,
        };
        *current = Some(handle.clone());
        handle
    }

    /// Cancel the running generation and clear the published text.
    /// Safe to call when idle.
    pub fn cancel(&self) {
        if let Some(handle) = self.inner.lock_current().take() {
            debug!("Cancelling generation {}", handle.id);
            handle.cancel.cancel();
        }
        self.inner.state.send_modify(|s| {
            s.running = false;
            s.output.clear();
            s.prompt_time = None;
        });
    }

    /// Cancel in-flight work, wait for it to let go of the model, and drop the
    /// model. The next `generate` loads it again.
    pub async fn unload_for_memory_pressure(&self, reason: &str, log_when_idle: bool) {
        let active = self.inner.lock_current().take();
        if let Some(handle) = &active {
            handle.cancel.cancel();
            handle.wait().await;
        }

        let mut load = self.inner.load.lock().await;
        let was_loaded = matches!(*load, LoadState::Loaded(_));
        *load = LoadState::Unloaded;
        drop(load);

        if was_loaded || active.is_some() {
            info!("Unloaded description model: {}", reason);
        } else if log_when_idle {
            info!("No description model loaded to unload ({})", reason);
        }
        self.inner.state.send_modify(|s| {
            s.running = false;
            s.output.clear();
            s.prompt_time = None;
            s.evaluation = EvaluationState::Idle;
            if was_loaded {
                s.model_info = format!("Unloaded: {reason}");
            }
        });
    }
}

impl Inner {
    fn lock_current(&self) -> MutexGuard<'_, Option<InferenceHandle>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_info(&self, info: impl Into<String>) {
        let info = info.into();
        self.state.send_modify(|s| s.model_info = info);
    }

    async fn ensure_loaded(&self) -> GenResult<Arc<dyn DescriptionModel>> {
        let mut load = self.load.lock().await;
        if let LoadState::Loaded(model) = &*load {
            return Ok(Arc::clone(model));
        }

        if let Some(assets) = self.assets.as_ref().filter(|a| !a.model_exists()) {
            info!("Description model not on disk, requesting download");
            self.set_info("Preparing download...");
            self.download(assets.as_ref()).await?;
            self.set_info("Download complete");
        }

        self.set_info(format!("Loading {}...", self.engine.name()));
        let model = self.engine.load().await?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        *load = LoadState::Loaded(Arc::clone(&model));
        self.set_info("Loaded");
        info!("Loaded description model {}", self.engine.name());
        Ok(model)
    }

    /// Run the asset download, mirroring its status into `model_info`.
    async fn download(&self, assets: &dyn ModelAssets) -> GenResult<()> {
        let mut status = assets.subscribe();
        let download = assets.download();
        tokio::pin!(download);
        loop {
            tokio::select! {
                result = &mut download => return result,
                changed = status.changed() => match changed {
                    Ok(()) => {
                        let text = status.borrow_and_update().clone();
                        self.set_info(text);
                    }
                    Err(_) => return (&mut download).await,
                },
            }
        }
    }

    async fn execute(
        self: &Arc<Self>,
        input: DescriptionInput,
        stream: bool,
        cancel: &CancellationToken,
    ) -> GenResult<String> {
        let model = self.ensure_loaded().await?;
        if cancel.is_cancelled() {
            return Err(GenError::cancelled("description"));
        }

        let params = SamplingParams {
            temperature: self.params.temperature,
            seed: clock_seed(),
        };
        let inner = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let limits = inner.params;
            let started = Instant::now();
            let mut seen_first = false;
            let mut on_token = |tokens: &[u32]| {
                if cancel.is_cancelled() {
                    return TokenControl::Stop;
                }
                if !seen_first {
                    seen_first = true;
                    let elapsed = started.elapsed();
                    let text = stream.then(|| model.decode(tokens));
                    inner.state.send_modify(|s| {
                        s.evaluation = EvaluationState::GeneratingResponse;
                        s.prompt_time = Some(elapsed);
                        if let Some(text) = text {
                            s.output = text;
                        }
                    });
                }
                if stream && tokens.len() % limits.display_every_n_tokens.max(1) == 0 {
                    let text = model.decode(tokens);
                    inner.state.send_modify(|s| s.output = text);
                }
                if tokens.len() >= limits.max_tokens {
                    TokenControl::Stop
                } else {
                    TokenControl::More
                }
            };
            model.generate(&input, params, &cancel, &mut on_token)
        })
        .await
        .map_err(|e| GenError::engine("description", format!("generation task failed: {e}")))?
    }
}

async fn run(
    inner: Arc<Inner>,
    id: u64,
    input: DescriptionInput,
    stream: bool,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
) -> Option<String> {
    let result = inner.execute(input, stream, &cancel).await;

    let mut current = inner.lock_current();
    let is_current = match current.as_ref() {
        Some(handle) => handle.id == id,
        None => true,
    };
    if current.as_ref().is_some_and(|h| h.id == id) {
        *current = None;
    }
    finished.store(true, Ordering::Release);

    let cancelled = cancel.is_cancelled();
    let is_latest = inner.next_id.load(Ordering::Relaxed) == id;
    let output = match result {
        _ if cancelled => None,
        Ok(text) => Some(text),
        Err(e) if e.is_cancellation() => None,
        Err(e) => {
            log!(e.severity().log_level(), "Generation {} failed: {}", id, e);
            Some(format!("Failed: {e}"))
        }
    };
    inner.state.send_modify(|s| {
        match &output {
            Some(text) => s.output = text.clone(),
            // A token may have been published after the cancel cleared it.
            None if is_latest => s.output.clear(),
            None => {}
        }
        if is_current {
            s.running = false;
            s.evaluation = EvaluationState::Idle;
        }
    });
    drop(current);
    debug!("Generation {} finished (cancelled: {})", id, cancelled);
    output
}
