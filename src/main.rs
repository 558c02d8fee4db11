use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use cam_scale::presets::SnapshotPreset;
use clap::{Parser, Subcommand};
use genai_cam::{
    CameraSession,
    capture::StillImageSource,
    config::{DescriptionMode, JsonSettingsStore, StudioConfig},
    inference::{
        LocalModelDirectory,
        http::{HttpDescriptionEngine, HttpEngineConfig},
    },
};
use log::info;

/// Describe camera frames with a vision-language model and reimagine them.
#[derive(Parser, Debug)]
#[command(name = "genai-cam")]
#[command(about = "📷 Describe photos with a vision-language model")]
#[command(long_about = "Describe photos with a vision-language model served over HTTP.
A still image stands in for the camera: it is replayed as a live feed.")]
struct Args {
    /// Description server root
    #[arg(long, default_value = "http://localhost:8001", help = "OpenAI-responses compatible server")]
    server: String,

    #[arg(long, default_value = "fastvlm", help = "Model name sent to the server")]
    model: String,

    #[arg(long, help = "Bearer token for the server")]
    api_key: Option<String>,

    #[arg(long, default_value_t = 240, help = "Maximum tokens per description")]
    max_tokens: usize,

    #[arg(long, value_enum, default_value = "preview1024", help = "Snapshot size sent to the model")]
    preset: SnapshotPreset,

    /// Generation settings file
    #[arg(long, help = "JSON file holding the generation settings")]
    settings: Option<PathBuf>,

    /// Local model directory to check before loading
    #[arg(long, help = "Directory that must contain the model files")]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture the image once and print its short and long descriptions
    Describe {
        image: PathBuf,
    },
    /// Describe the image repeatedly, as real-time mode does with a camera
    Live {
        image: PathBuf,

        #[arg(long, value_enum, default_value = "short")]
        mode: DescriptionMode,

        #[arg(short, long, default_value_t = 3, help = "Number of descriptions to print")]
        passes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = StudioConfig::default();
    config.max_tokens = args.max_tokens;
    config.snapshot_preset = args.preset;
    config.validate().map_err(anyhow::Error::msg)?;

    let engine = Arc::new(HttpDescriptionEngine::new(HttpEngineConfig {
        base_url: args.server.trim_end_matches('/').to_string(),
        model: args.model.clone(),
        api_key: args.api_key.clone(),
        max_output_tokens: args.max_tokens,
        ..HttpEngineConfig::default()
    }));
    let mut builder = CameraSession::builder(engine).with_config(config);
    if let Some(path) = &args.settings {
        builder = builder.with_settings(Arc::new(JsonSettingsStore::open(path)?));
    }
    if let Some(dir) = &args.model_dir {
        builder = builder.with_assets(Arc::new(LocalModelDirectory::new(dir)));
    }

    match args.command {
        Command::Describe { image } => describe(builder.build()?, image).await,
        Command::Live { image, mode, passes } => {
            let session = builder.with_realtime(true).build()?;
            session.live().set_mode(mode);
            live(session, image, passes).await
        }
    }
}

fn open_source(image: &Path) -> Result<Box<StillImageSource>> {
    let source = StillImageSource::open(image)?
        .with_repeat(None)
        .with_interval(Duration::from_millis(100));
    Ok(Box::new(source))
}

async fn describe(session: CameraSession, image: PathBuf) -> Result<()> {
    session.start(open_source(&image)?).await?;
    wait_for_first_frame(&session).await?;

    if !session.capture().await {
        bail!("No frame to capture");
    }
    session.wait_for_photo_flow().await;
    let descriptions = session.descriptions().snapshot();
    println!("Short: {}", descriptions.short);
    println!("Long:  {}", descriptions.long);

    let mut generation = session.generation().subscribe();
    let status = generation
        .wait_for(|s| !s.is_generating)
        .await
        .ok()
        .and_then(|snapshot| snapshot.status.clone());
    if let Some(status) = status {
        println!("Generation: {status}");
    }

    if let Some(stats) = session.shutdown().await {
        info!("{} frames distributed", stats.frames);
    }
    Ok(())
}

async fn live(session: CameraSession, image: PathBuf, passes: usize) -> Result<()> {
    let mut inference = session.inference().subscribe();
    session.start(open_source(&image)?).await?;

    let mut printed = 0;
    let mut was_running = false;
    while printed < passes {
        inference
            .changed()
            .await
            .context("Inference session went away")?;
        let snapshot = inference.borrow_and_update().clone();
        if was_running && !snapshot.running && !snapshot.output.is_empty() {
            printed += 1;
            println!("[{printed}] {}", snapshot.output);
        }
        was_running = snapshot.running;
    }

    session.shutdown().await;
    info!("{} live passes", session.live_stats().await.iterations);
    Ok(())
}

async fn wait_for_first_frame(session: &CameraSession) -> Result<()> {
    for _ in 0..50 {
        if session.latest_frame().is_some() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("No frame arrived from the image source")
}
