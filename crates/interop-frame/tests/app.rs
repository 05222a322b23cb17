use std::path::PathBuf;
use std::sync::Arc;

use gpu_interop::soft::{SoftAdapter, SoftAdapterConfig, SoftComputeDevice};
use gpu_interop::SharingStrategy;
use interop_core::{ManualClock, SourceImage};
use interop_frame::backend::soft_bridge;
use interop_frame::{InteropApp, InteropConfig, Key};

fn app(config: InteropConfig) -> (SoftAdapter, InteropApp<SoftComputeDevice>) {
    let adapter = SoftAdapter::new(SoftAdapterConfig::default());
    let strategy = config.strategy;
    let mut app = InteropApp::new(config, Arc::new(ManualClock::new())).unwrap();
    app.init(soft_bridge(&adapter, strategy).unwrap()).unwrap();
    (adapter, app)
}

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("interop-frame-{}-{name}", std::process::id()))
}

#[test]
fn default_run_renders_past_one_rotation() {
    let (_adapter, mut app) = app(InteropConfig::default());
    app.run().unwrap();
    assert_eq!(app.stats().frame_count(), 10);
    assert!(app.stats().fence_waits() >= 1);
    app.destroy().unwrap();
    assert!(app.orchestrator().is_none());
}

#[test]
fn screenshot_is_the_grayscale_image() {
    let path = scratch_path("screenshot.png");
    let source = scratch_path("source.png");
    let mut texels = [0u8, 0, 255, 255].repeat(4);
    texels[..4].copy_from_slice(&[255, 0, 0, 255]);
    SourceImage::from_rgba8(2, 2, texels)
        .unwrap()
        .save_png(&source)
        .unwrap();

    let (_adapter, mut app) = app(InteropConfig {
        strategy: SharingStrategy::CrossDevice,
        image: Some(source.clone()),
        screenshot: Some(path.clone()),
        frames: Some(2),
        ..InteropConfig::default()
    });
    app.run().unwrap();
    app.destroy().unwrap();

    let shot = SourceImage::open(&path).unwrap();
    assert_eq!((shot.width, shot.height), (2, 2));
    assert_eq!(&shot.rgba8[..4], &[76, 76, 76, 255]);
    // Blue: 0.114 * 255 = 29.07
    assert_eq!(&shot.rgba8[4..8], &[29, 29, 29, 255]);

    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(source);
}

#[test]
fn keys_toggle_pause_fps_and_quit() {
    let (_adapter, mut app) = app(InteropConfig::default());
    assert!(app.window_title().ends_with("fps: 0.00"));

    app.key_up(Key::F1);
    assert!(app.window_title().ends_with("[F1]"));
    app.key_up(Key::Space);
    assert!(app.stats().is_paused());

    app.key_up(Key::Escape);
    assert!(app.quit_requested());
    app.run().unwrap();
    assert_eq!(app.stats().frame_count(), 0);
}

#[test]
fn title_names_strategy() {
    let (_adapter, app) = app(InteropConfig {
        strategy: SharingStrategy::CrossDevice,
        ..InteropConfig::default()
    });
    let title = app.window_title();
    assert!(title.contains("cross-device export/import"), "{title}");
    assert!(!title.contains("(WARP)"));
}

#[test]
fn missing_image_names_the_path() {
    let adapter = SoftAdapter::new(SoftAdapterConfig::default());
    let mut app: InteropApp<SoftComputeDevice> = InteropApp::new(
        InteropConfig {
            image: Some(PathBuf::from("/nonexistent/source.png")),
            ..InteropConfig::default()
        },
        Arc::new(ManualClock::new()),
    )
    .unwrap();
    let err = app
        .init(soft_bridge(&adapter, SharingStrategy::SameDevice).unwrap())
        .unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/source.png"));
}

#[test]
fn render_before_init_fails() {
    let mut app: InteropApp<SoftComputeDevice> =
        InteropApp::new(InteropConfig::default(), Arc::new(ManualClock::new())).unwrap();
    assert!(app.render().is_err());
}
