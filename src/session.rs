//! # Camera Session
//!
//! Wires the pipeline together for one camera:
//!
//! ```text
//! FrameSource ──▶ FrameDistributor ──▶ display lane ──▶ caller
//!                        │
//!                        ├──▶ analyze lane ──▶ LiveAnalysis ──▶ InferenceSession
//!                        │
//!                        └──▶ latest frame ──capture()──▶ photo flow
//!                                                   short ─▶ generation ─▶ long
//! ```
//!
//! Built with [`CameraSession::builder`]. Only the description engine is
//! required; the image providers default to engines that report themselves
//! unavailable.

use std::sync::{Arc, Mutex, MutexGuard};

use fast_image_resize::Resizer;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    capture::{FrameSource, frame_stream},
    config::{
        StudioConfig,
        settings::{MemorySettingsStore, SettingsStore},
    },
    core::{
        frame::{Frame, RasterImage},
        latest_buffer::LatestReceiver,
    },
    description::DescriptionPipeline,
    error::{GenError, GenResult},
    generation::{
        GenerationHandle, GenerationOptions, GenerationOrchestrator, MemoryPolicy, ProviderKind,
        diffusion::{DiffusionEngine, DiffusionProvider, UnavailableDiffusionEngine},
        style::{StyleEngine, StyleProvider, UnavailableStyleEngine},
    },
    inference::{DescriptionEngine, InferenceParams, InferenceSession, assets::ModelAssets},
    live::{LiveAnalysis, LiveStats},
    processing::{DistributorStats, FrameDistributor, LatestFrame, RealtimeFlag},
};

pub const DESCRIBING_STATUS: &str = "Describing image...";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Task<T> {
    cancel: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T> Task<T> {
    async fn stop(self) -> Option<T> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Session task failed: {}", e);
                None
            }
        }
    }
}

/// The analyze lane is either parked here or owned by a running live loop.
#[derive(Default)]
struct LiveState {
    parked: Option<LatestReceiver<Frame>>,
    running: Option<Task<(LatestReceiver<Frame>, LiveStats)>>,
    stats: LiveStats,
}

pub struct CameraSession {
    config: Arc<StudioConfig>,
    inference: InferenceSession,
    descriptions: DescriptionPipeline,
    generation: GenerationOrchestrator,
    live: LiveAnalysis,
    realtime: RealtimeFlag,
    latest: LatestFrame,
    display: Mutex<Option<LatestReceiver<Frame>>>,
    live_state: tokio::sync::Mutex<LiveState>,
    distributor: Mutex<Option<Task<DistributorStats>>>,
    photo_flow: Mutex<Option<Task<()>>>,
    captured: Mutex<Option<RasterImage>>,
}

impl CameraSession {
    pub fn builder(description_engine: Arc<dyn DescriptionEngine>) -> CameraSessionBuilder {
        CameraSessionBuilder::new(description_engine)
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn inference(&self) -> &InferenceSession {
        &self.inference
    }

    pub fn descriptions(&self) -> &DescriptionPipeline {
        &self.descriptions
    }

    pub fn generation(&self) -> &GenerationOrchestrator {
        &self.generation
    }

    pub fn live(&self) -> &LiveAnalysis {
        &self.live
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime.get()
    }

    /// The last snapshot taken by [`CameraSession::capture`].
    pub fn captured_image(&self) -> Option<RasterImage> {
        lock(&self.captured).clone()
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest.get()
    }

    /// Start distributing frames from `source`. A session runs one source at
    /// a time; another can start once the previous feed has ended.
    pub async fn start(&self, source: Box<dyn FrameSource>) -> GenResult<()> {
        let size = source.input_size();
        let analyze = {
            let mut distributor = lock(&self.distributor);
            if distributor.as_ref().is_some_and(|task| !task.handle.is_finished()) {
                return Err(GenError::config(
                    "source",
                    "camera",
                    "session is already running a frame source",
                ));
            }
            let (fan_out, lanes) =
                FrameDistributor::new(self.realtime.clone(), self.latest.clone());
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(fan_out.run(frame_stream(source), cancel.clone()));
            *distributor = Some(Task { cancel, handle });
            *lock(&self.display) = Some(lanes.display);
            lanes.analyze
        };
        info!("Camera session started with {}x{} input", size.w, size.h);

        let mut live = self.live_state.lock().await;
        live.parked = Some(analyze);
        if self.realtime.get() {
            self.start_live(&mut live).await;
        }
        Ok(())
    }

    /// Frames for the preview. Available once after [`CameraSession::start`].
    pub fn take_display_lane(&self) -> Option<LatestReceiver<Frame>> {
        lock(&self.display).take()
    }

    /// Switch real-time analysis on or off. Any running description is
    /// cancelled either way.
    pub async fn set_realtime(&self, enabled: bool) {
        let mut live = self.live_state.lock().await;
        self.realtime.set(enabled);
        self.inference.cancel();

        if enabled {
            self.start_live(&mut live).await;
            return;
        }

        if let Some(task) = live.running.take() {
            if let Some((mut lane, stats)) = task.stop().await {
                live.stats.iterations += stats.iterations;
                if lane.drain() {
                    debug!("Dropped a buffered analysis frame");
                }
                live.parked = Some(lane);
            }
        }
        info!("Real-time analysis off");
    }

    /// Whether a live analysis loop is consuming frames right now.
    pub async fn is_live_analysis_running(&self) -> bool {
        let live = self.live_state.lock().await;
        live.running.as_ref().is_some_and(|task| !task.handle.is_finished())
    }

    async fn start_live(&self, live: &mut LiveState) {
        Self::reap_live(live).await;
        if live.running.is_some() {
            return;
        }
        let Some(lane) = live.parked.take() else {
            debug!("Real-time analysis waits for a frame source");
            return;
        };
        let cancel = CancellationToken::new();
        let analysis = self.live.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { analysis.run(lane, token).await });
        live.running = Some(Task { cancel, handle });
        info!("Real-time analysis on");
    }

    /// Collect a loop that ended on its own because its lane closed.
    async fn reap_live(live: &mut LiveState) {
        if !live.running.as_ref().is_some_and(|task| task.handle.is_finished()) {
            return;
        }
        let Some(task) = live.running.take() else {
            return;
        };
        if let Some((lane, stats)) = task.stop().await {
            live.stats.iterations += stats.iterations;
            if live.parked.is_none() {
                live.parked = Some(lane);
            }
        }
        debug!("Collected a finished live analysis loop");
    }

    /// Passes completed by live loops that have been stopped.
    pub async fn live_stats(&self) -> LiveStats {
        self.live_state.lock().await.stats
    }

    /// Take a photo of the latest frame and start describing it. Returns
    /// `false` when no frame has arrived yet.
    pub async fn capture(&self) -> bool {
        let Some(frame) = self.latest.get() else {
            warn!("Capture requested before the first frame");
            return false;
        };
        if self.realtime.get() {
            self.set_realtime(false).await;
        }

        let max_side = self.config.snapshot_preset.max_long_side();
        let snapshot = match RasterImage::from_frame(&frame, max_side, &mut Resizer::new()) {
            Ok(image) => image,
            Err(e) => {
                error!("Failed to snapshot frame: {}", e);
                return false;
            }
        };
        info!(
            "Captured {}x{} snapshot",
            snapshot.width(),
            snapshot.height()
        );

        if let Some(previous) = lock(&self.photo_flow).take() {
            previous.cancel.cancel();
        }
        self.inference.cancel();
        self.generation.cancel_generation();
        self.descriptions.clear();
        *lock(&self.captured) = Some(snapshot.clone());
        self.generation.set_source_image(Some(snapshot.clone()));
        self.generation.clear_output();
        self.generation.set_status(Some(DESCRIBING_STATUS.to_string()));

        let cancel = CancellationToken::new();
        let flow = PhotoFlow {
            descriptions: self.descriptions.clone(),
            generation: self.generation.clone(),
        };
        let token = cancel.clone();
        let handle = tokio::spawn(async move { flow.run(snapshot, token).await });
        *lock(&self.photo_flow) = Some(Task { cancel, handle });
        true
    }

    /// Wait for the current photo flow to finish. Generation it started may
    /// still be running afterwards.
    pub async fn wait_for_photo_flow(&self) {
        let task = lock(&self.photo_flow).take();
        if let Some(task) = task {
            if let Err(e) = task.handle.await {
                error!("Photo flow failed: {}", e);
            }
        }
    }

    /// Throw the photo away and go back to the camera.
    pub async fn retake(&self) {
        let flow = lock(&self.photo_flow).take();
        if let Some(flow) = flow {
            flow.stop().await;
        }
        self.inference.cancel();
        self.generation.cancel_generation();
        self.descriptions.clear();
        lock(&self.captured).take();
        self.generation.set_source_image(None);
        self.generation.clear_output();
        info!("Photo discarded");
    }

    /// Generate again from the captured photo.
    pub fn recreate(&self, options: GenerationOptions) -> Option<GenerationHandle> {
        self.generation.start_generation(options)
    }

    /// Release what can be reloaded later. The description model is only
    /// unloaded when no description is running.
    pub async fn handle_memory_warning(&self) {
        warn!("Memory warning received");
        self.generation.handle_memory_warning();
        if !self.inference.is_running() {
            self.inference
                .unload_for_memory_pressure("System memory warning", true)
                .await;
        }
    }

    /// Stop every task the session started. Returns what the distributor saw,
    /// `None` if the session was never started.
    pub async fn shutdown(&self) -> Option<DistributorStats> {
        self.set_realtime(false).await;
        let flow = lock(&self.photo_flow).take();
        if let Some(flow) = flow {
            flow.stop().await;
        }
        self.inference.cancel();
        self.generation.cancel_generation();

        let distributor = lock(&self.distributor).take();
        let stats = match distributor {
            Some(task) => task.stop().await,
            None => None,
        };
        info!("Camera session shut down");
        stats
    }
}

/// Describe the photo, then generate from it.
struct PhotoFlow {
    descriptions: DescriptionPipeline,
    generation: GenerationOrchestrator,
}

impl PhotoFlow {
    async fn run(self, image: RasterImage, cancel: CancellationToken) {
        let short = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            short = self.descriptions.describe_short(image.clone()) => short,
        };
        debug!("Short description ready ({} chars)", short.len());

        // Diffusion on a low-memory device unloads the description model, so
        // it has to wait for the long description. This includes falling back
        // to diffusion from an unavailable style provider.
        let generate_late = self.generation.memory_policy().unload_description_model()
            && self.generation.effective_provider() == Some(ProviderKind::Diffusion);
        if !generate_late {
            self.generate();
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            long = self.descriptions.describe_long(image) => {
                debug!("Long description ready ({} chars)", long.len());
            }
        }

        if generate_late {
            self.generate();
        }
    }

    fn generate(&self) {
        let resumed = self.generation.resume_deferred();
        if resumed.is_none()
            && self
                .generation
                .start_generation(GenerationOptions::default())
                .is_none()
        {
            debug!("No generation started for the photo");
        }
    }
}

pub struct CameraSessionBuilder {
    config: StudioConfig,
    description_engine: Arc<dyn DescriptionEngine>,
    assets: Option<Arc<dyn ModelAssets>>,
    diffusion_engine: Arc<dyn DiffusionEngine>,
    style_engine: Arc<dyn StyleEngine>,
    settings: Arc<dyn SettingsStore>,
    memory_policy: Option<MemoryPolicy>,
    realtime: bool,
}

impl CameraSessionBuilder {
    pub fn new(description_engine: Arc<dyn DescriptionEngine>) -> Self {
        Self {
            config: StudioConfig::default(),
            description_engine,
            assets: None,
            diffusion_engine: Arc::new(UnavailableDiffusionEngine),
            style_engine: Arc::new(UnavailableStyleEngine::default()),
            settings: Arc::new(MemorySettingsStore::default()),
            memory_policy: None,
            realtime: false,
        }
    }

    pub fn with_config(mut self, config: StudioConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_assets(mut self, assets: Arc<dyn ModelAssets>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_diffusion_engine(mut self, engine: Arc<dyn DiffusionEngine>) -> Self {
        self.diffusion_engine = engine;
        self
    }

    pub fn with_style_engine(mut self, engine: Arc<dyn StyleEngine>) -> Self {
        self.style_engine = engine;
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = settings;
        self
    }

    /// Overrides the policy detected from physical memory.
    pub fn with_memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = Some(policy);
        self
    }

    /// Start with real-time analysis on.
    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    pub fn build(self) -> GenResult<CameraSession> {
        self.config
            .validate()
            .map_err(|reason| GenError::config("config", "studio", reason))?;

        let policy = self
            .memory_policy
            .unwrap_or_else(|| MemoryPolicy::detect(self.config.low_memory_threshold_bytes));
        info!(
            "Memory policy: low memory = {}, pipeline cached = {}",
            policy.is_low_memory(),
            policy.cache_pipeline()
        );

        let config = Arc::new(self.config);
        let params = InferenceParams::from(config.as_ref());
        let inference = match self.assets {
            Some(assets) => InferenceSession::with_assets(self.description_engine, assets, params),
            None => InferenceSession::new(self.description_engine, params),
        };
        let descriptions = DescriptionPipeline::new(inference.clone(), &config);
        let generation = GenerationOrchestrator::new(
            Arc::new(DiffusionProvider::new(self.diffusion_engine, policy)),
            Arc::new(StyleProvider::new(self.style_engine)),
            self.settings,
            descriptions.subscribe(),
            policy,
            Some(inference.clone()),
        );
        let live = LiveAnalysis::new(inference.clone(), config.clone());

        Ok(CameraSession {
            config,
            inference,
            descriptions,
            generation,
            live,
            realtime: RealtimeFlag::new(self.realtime),
            latest: LatestFrame::default(),
            display: Mutex::new(None),
            live_state: tokio::sync::Mutex::new(LiveState::default()),
            distributor: Mutex::new(None),
            photo_flow: Mutex::new(None),
            captured: Mutex::new(None),
        })
    }
}
