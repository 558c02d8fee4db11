//! End-to-end tests of the camera session: capture to description to
//! generated image, real-time toggling, retake and memory handling.

mod common;

use std::{sync::Arc, time::Duration};

use cam_scale::presets::Size;
use common::{
    EventLog, MockDescriptionEngine, MockDiffusionEngine, MockStyleEngine, TIMEOUT, test_frame,
    wait_until,
};
use genai_cam::{
    capture::{CameraFeed, CameraFeedHandle},
    config::settings::{GenerationSettings, MemorySettingsStore},
    generation::{GenerationOptions, GenerationPhase, MemoryPolicy, PlaygroundStyle, ProviderKind},
    session::{CameraSession, DESCRIBING_STATUS},
};

struct Harness {
    session: CameraSession,
    camera: CameraFeedHandle,
    log: EventLog,
    diffusion: MockDiffusionEngine,
}

async fn harness(
    description: MockDescriptionEngine,
    policy: MemoryPolicy,
    realtime: bool,
) -> Harness {
    let log = description.log.clone();
    let diffusion = MockDiffusionEngine::new(log.clone());
    let session = CameraSession::builder(Arc::new(description))
        .with_diffusion_engine(Arc::new(diffusion.clone()))
        .with_style_engine(Arc::new(MockStyleEngine::new(log.clone())))
        .with_memory_policy(policy)
        .with_realtime(realtime)
        .build()
        .expect("session builds");

    let (feed, camera) = CameraFeed::new(Size { w: 64, h: 48 });
    session.start(Box::new(feed)).await.expect("session starts");
    Harness {
        session,
        camera,
        log,
        diffusion,
    }
}

async fn push_and_settle(h: &Harness, tag: u8) {
    assert!(h.camera.push(test_frame(tag)));
    tokio::time::timeout(TIMEOUT, async {
        while h.session.latest_frame().map(|f| f.data[0]) != Some(tag) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("frame reached the session");
}

#[tokio::test]
async fn capture_describes_photo_and_generates_image() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;
    let mut display = h.session.take_display_lane().expect("display lane");
    assert!(h.session.take_display_lane().is_none());

    push_and_settle(&h, 7).await;
    assert_eq!(display.recv().await.map(|f| f.data[0]), Some(7));

    let mut generation = h.session.generation().subscribe();
    assert!(h.session.capture().await);
    assert_eq!(
        h.session.generation().snapshot().status.as_deref(),
        Some(DESCRIBING_STATUS)
    );
    let captured = h.session.captured_image().expect("snapshot kept");
    assert_eq!((captured.width(), captured.height()), (64, 48));

    h.session.wait_for_photo_flow().await;
    let descriptions = h.session.descriptions().snapshot();
    assert_eq!(descriptions.short, "A red bicycle");
    assert_eq!(
        descriptions.long,
        "A red bicycle leaning against a white brick wall in the sun"
    );

    let done = wait_until(&mut generation, |s| s.phase == GenerationPhase::Completed).await;
    assert!(done.image.is_some());
    assert_eq!(done.status, None);
    assert_eq!(done.provider, Some(ProviderKind::Diffusion));

    // Generation starts as soon as the short description exists.
    assert!(h.log.position("finished short") < h.log.position("diffusion generate"));
    assert!(h.diffusion.prompts()[0].starts_with("A red bicycle"));
    assert!(h.session.inference().is_loaded().await);

    h.session.shutdown().await;
}

#[tokio::test]
async fn low_memory_unloads_description_model_before_diffusion() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::low_memory(),
        false,
    )
    .await;
    push_and_settle(&h, 1).await;

    let mut generation = h.session.generation().subscribe();
    assert!(h.session.capture().await);
    h.session.wait_for_photo_flow().await;
    wait_until(&mut generation, |s| s.phase == GenerationPhase::Completed).await;

    let events = h.log.events();
    let long = h.log.position("finished long").expect("long description");
    let dropped = h.log.position("model dropped").expect("model unloaded");
    let load = h.log.position("load_pipeline").expect("pipeline loaded");
    assert!(long < dropped, "{events:?}");
    assert!(dropped < load, "{events:?}");
    assert!(!h.session.inference().is_loaded().await);

    // The prompt uses the long description.
    assert!(h.diffusion.prompts()[0].contains("white brick wall"));
    assert!(
        h.session
            .inference()
            .snapshot()
            .model_info
            .starts_with("Unloaded:")
    );
}

#[tokio::test]
async fn capture_without_frame_does_nothing() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;

    assert!(!h.session.capture().await);
    assert!(h.session.captured_image().is_none());
    assert!(h.log.events().is_empty());
}

#[tokio::test]
async fn realtime_off_mid_analysis_stops_describing() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()).with_token_delay(Duration::from_millis(30)),
        MemoryPolicy::unconstrained(),
        true,
    )
    .await;
    assert!(h.session.is_realtime());
    let mut inference = h.session.inference().subscribe();

    assert!(h.camera.push(test_frame(1)));
    wait_until(&mut inference, |s| s.running).await;

    h.session.set_realtime(false).await;
    assert!(!h.session.is_realtime());
    let snapshot = h.session.inference().snapshot();
    assert!(!snapshot.running);
    assert!(snapshot.output.is_empty());

    // Frames that arrive now are not analysed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let generations = h.log.count("generate");
    push_and_settle(&h, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.log.count("generate"), generations);
    assert!(!h.session.inference().is_running());
    assert_eq!(h.session.live_stats().await.iterations, 0);
}

#[tokio::test]
async fn realtime_can_be_switched_back_on() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;
    let mut inference = h.session.inference().subscribe();

    h.session.set_realtime(true).await;
    assert!(h.camera.push(test_frame(3)));
    wait_until(&mut inference, |s| !s.running && s.output == "A red bicycle").await;

    h.session.set_realtime(false).await;
    assert_eq!(h.log.count("generate short"), 1);
}

#[tokio::test]
async fn capture_leaves_realtime_mode() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        true,
    )
    .await;
    push_and_settle(&h, 4).await;

    assert!(h.session.capture().await);
    assert!(!h.session.is_realtime());
    h.session.wait_for_photo_flow().await;
    assert_eq!(h.session.descriptions().snapshot().short, "A red bicycle");
}

#[tokio::test]
async fn retake_discards_photo_and_results() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;
    push_and_settle(&h, 5).await;
    let mut generation = h.session.generation().subscribe();

    assert!(h.session.capture().await);
    h.session.wait_for_photo_flow().await;
    wait_until(&mut generation, |s| s.phase == GenerationPhase::Completed).await;

    h.session.retake().await;
    assert!(h.session.captured_image().is_none());
    assert!(!h.session.descriptions().snapshot().has_any());
    let snapshot = h.session.generation().snapshot();
    assert!(snapshot.image.is_none());
    assert_eq!(snapshot.status, None);
    assert!(h.session.generation().source_image().is_none());
    assert!(h.session.recreate(GenerationOptions::default()).is_none());
}

#[tokio::test]
async fn recreate_uses_the_captured_photo() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;
    push_and_settle(&h, 6).await;
    let mut generation = h.session.generation().subscribe();
    assert!(h.session.capture().await);
    h.session.wait_for_photo_flow().await;
    wait_until(&mut generation, |s| s.phase == GenerationPhase::Completed).await;

    let handle = h
        .session
        .recreate(GenerationOptions {
            provider: Some(ProviderKind::Style),
            style: Some(PlaygroundStyle::Illustration),
        })
        .expect("recreates");
    handle.wait().await;

    assert_eq!(h.log.count("style Illustration"), 1);
    assert_eq!(
        h.session.generation().snapshot().provider,
        Some(ProviderKind::Style)
    );
}

#[tokio::test]
async fn memory_warning_unloads_idle_description_model() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;
    push_and_settle(&h, 8).await;
    let mut generation = h.session.generation().subscribe();
    assert!(h.session.capture().await);
    h.session.wait_for_photo_flow().await;
    wait_until(&mut generation, |s| s.phase == GenerationPhase::Completed).await;
    assert!(h.session.inference().is_loaded().await);

    h.session.handle_memory_warning().await;
    assert!(!h.session.inference().is_loaded().await);
    assert_eq!(h.log.count("model dropped"), 1);
}

#[tokio::test]
async fn shutdown_stops_distribution() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;
    push_and_settle(&h, 9).await;

    let stats = h.session.shutdown().await.expect("session was running");
    assert!(stats.frames >= 1);
    assert_eq!(stats.analyzed, 0);
    assert!(h.session.shutdown().await.is_none());
}

#[tokio::test]
async fn session_runs_one_source() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        false,
    )
    .await;
    let (feed, _camera) = CameraFeed::new(Size { w: 8, h: 8 });
    assert!(h.session.start(Box::new(feed)).await.is_err());
}

#[tokio::test]
async fn low_memory_fallback_to_diffusion_keeps_long_description() {
    let log = EventLog::default();
    let diffusion = MockDiffusionEngine::new(log.clone());
    let session = CameraSession::builder(Arc::new(MockDescriptionEngine::new(log.clone())))
        .with_diffusion_engine(Arc::new(diffusion.clone()))
        .with_style_engine(Arc::new(MockStyleEngine::new(log.clone()).unavailable()))
        .with_settings(Arc::new(MemorySettingsStore::new(GenerationSettings {
            provider: ProviderKind::Style,
            ..GenerationSettings::default()
        })))
        .with_memory_policy(MemoryPolicy::low_memory())
        .build()
        .expect("session builds");
    assert_eq!(session.generation().effective_provider(), Some(ProviderKind::Diffusion));

    let (feed, camera) = CameraFeed::new(Size { w: 64, h: 48 });
    session.start(Box::new(feed)).await.expect("session starts");
    assert!(camera.push(test_frame(1)));
    tokio::time::timeout(TIMEOUT, async {
        while session.latest_frame().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("frame reached the session");

    let mut generation = session.generation().subscribe();
    assert!(session.capture().await);
    session.wait_for_photo_flow().await;
    let done = wait_until(&mut generation, |s| s.phase == GenerationPhase::Completed).await;
    assert_eq!(done.provider, Some(ProviderKind::Diffusion));

    assert_eq!(
        session.descriptions().snapshot().long,
        "A red bicycle leaning against a white brick wall in the sun"
    );
    let events = log.events();
    let long = log.position("finished long").expect("long description");
    let load = log.position("load_pipeline").expect("pipeline loaded");
    assert!(long < load, "{events:?}");
    assert!(diffusion.prompts()[0].contains("white brick wall"));
    assert_eq!(session.generation().settings().provider, ProviderKind::Diffusion);
}

#[tokio::test]
async fn realtime_resumes_on_a_new_source_after_the_feed_ended() {
    let h = harness(
        MockDescriptionEngine::new(EventLog::default()),
        MemoryPolicy::unconstrained(),
        true,
    )
    .await;
    assert!(h.camera.push(test_frame(1)));
    tokio::time::timeout(TIMEOUT, async {
        while h.log.count("finished short") < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first frame described");

    // Ending the feed closes the analyze lane and ends the live loop.
    h.camera.finish();
    tokio::time::timeout(TIMEOUT, async {
        while h.session.is_live_analysis_running().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("live loop ended");

    // The distributor may still be winding down for a moment.
    let camera = tokio::time::timeout(TIMEOUT, async {
        loop {
            let (feed, camera) = CameraFeed::new(Size { w: 64, h: 48 });
            if h.session.start(Box::new(feed)).await.is_ok() {
                break camera;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("new source starts");
    assert!(h.session.is_live_analysis_running().await);

    assert!(camera.push(test_frame(2)));
    tokio::time::timeout(TIMEOUT, async {
        while h.log.count("finished short") < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("new source analysed");
    assert_eq!(h.session.live_stats().await.iterations, 1);
    h.session.shutdown().await;
}
