use std::sync::Arc;
use std::time::Duration;

use gpu_interop::soft::{SoftAdapter, SoftAdapterConfig, SoftComputeDevice};
use gpu_interop::{InteropBridge, PresentRuntime, SharingStrategy};
use interop_core::{
    luminance, Extent, GrayscaleKernel, InteropError, InteropStep, Kernel, ManualClock,
    SourceImage, Texel, TexelView, TextureDesc, TextureFormat, UsageFlags,
};
use interop_frame::backend::soft_bridge;
use interop_frame::{Dispatcher, FrameOrchestrator, FrameStatsAccumulator, SlotState};
use pretty_assertions::assert_eq;

const STRATEGIES: [SharingStrategy; 2] = [SharingStrategy::SameDevice, SharingStrategy::CrossDevice];

fn source_desc(width: u32, height: u32, format: TextureFormat) -> TextureDesc {
    TextureDesc::new(width, height, format).with_usage(UsageFlags::SHADER_READ)
}

fn result_desc(width: u32, height: u32, format: TextureFormat) -> TextureDesc {
    TextureDesc::new(width, height, format).with_usage(UsageFlags::UNORDERED_WRITE)
}

/// Create a pair, dispatch `kernel` once and read the result back.
fn run_kernel(
    bridge: &mut InteropBridge<SoftComputeDevice>,
    kernel: Arc<dyn Kernel>,
    source: &TextureDesc,
    texels: &[u8],
    result: &TextureDesc,
    strategy: SharingStrategy,
) -> Result<Vec<u8>, InteropError> {
    let pair = bridge.create_aliased_pair(source, texels, result, strategy)?;
    let mut dispatcher = Dispatcher::new(kernel, &pair)?;
    let (present, compute) = bridge.runtimes_mut();
    dispatcher.dispatch(compute)?;
    dispatcher.before_read(present)?;
    dispatcher.after_read(present)?;
    present.read_texture(pair.result.texture, pair.result_state)
}

fn orchestrator(
    adapter: &SoftAdapter,
    strategy: SharingStrategy,
    image: &SourceImage,
) -> FrameOrchestrator<SoftComputeDevice> {
    let mut bridge = soft_bridge(adapter, strategy).unwrap();
    let format = TextureFormat::Rgba8Unorm;
    let pair = bridge
        .create_aliased_pair(
            &source_desc(image.width, image.height, format),
            &image.rgba8,
            &result_desc(image.width, image.height, format),
            strategy,
        )
        .unwrap();
    FrameOrchestrator::new(bridge, pair, Arc::new(GrayscaleKernel), 3).unwrap()
}

fn stats() -> FrameStatsAccumulator {
    FrameStatsAccumulator::new(Arc::new(ManualClock::new()))
}

// ---------------------------------------------------------------------------
// Kernel output through the bridge
// ---------------------------------------------------------------------------

#[test]
fn red_texel_becomes_gray_76() {
    let mut texels = vec![0u8; 4 * 4 * 4];
    texels[..4].copy_from_slice(&[255, 0, 0, 255]);
    for strategy in STRATEGIES {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let mut bridge = soft_bridge(&adapter, strategy).unwrap();
        let result = run_kernel(
            &mut bridge,
            Arc::new(GrayscaleKernel),
            &source_desc(4, 4, TextureFormat::Rgba8Unorm),
            &texels,
            &result_desc(4, 4, TextureFormat::Rgba8Unorm),
            strategy,
        )
        .unwrap();
        assert_eq!(&result[..4], &[76, 76, 76, 255], "{}", strategy.name());
        assert_eq!(&result[4..8], &[0, 0, 0, 0], "{}", strategy.name());
    }
}

#[test]
fn grayscale_holds_for_every_format_pair() {
    let image = SourceImage::sample(8, 8);
    for source_format in TextureFormat::ALL {
        for result_format in TextureFormat::ALL {
            let adapter = SoftAdapter::new(SoftAdapterConfig::default());
            let mut bridge = soft_bridge(&adapter, SharingStrategy::SameDevice).unwrap();
            let source = source_desc(8, 8, source_format);
            let texels = image.to_format(source_format);
            let bytes = run_kernel(
                &mut bridge,
                Arc::new(GrayscaleKernel),
                &source,
                &texels,
                &result_desc(8, 8, result_format),
                SharingStrategy::SameDevice,
            )
            .unwrap();

            let source_view = TexelView::new(&texels, source.extent(), source_format).unwrap();
            let result_view = TexelView::new(&bytes, source.extent(), result_format).unwrap();
            let step = 1.0 / ((1u32 << result_format.channel_bits()) - 1) as f32;
            for y in 0..8 {
                for x in 0..8 {
                    let input = source_view.load(x, y);
                    let output = result_view.load(x, y);
                    assert_eq!(output.r, output.g, "{source_format:?} -> {result_format:?}");
                    assert_eq!(output.g, output.b, "{source_format:?} -> {result_format:?}");
                    assert!(
                        (output.r - luminance(input)).abs() <= step,
                        "{source_format:?} -> {result_format:?} at ({x}, {y})"
                    );
                    assert!((output.a - input.a).abs() <= step);
                }
            }
        }
    }
}

/// Returns the source texel unchanged.
struct Passthrough;

impl Kernel for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn shade(&self, source: &TexelView<'_>, x: u32, y: u32, _result: Extent) -> Texel {
        source.load(x, y)
    }
}

#[test]
fn same_device_round_trip_preserves_texels() {
    let adapter = SoftAdapter::new(SoftAdapterConfig::default());
    let mut bridge = soft_bridge(&adapter, SharingStrategy::SameDevice).unwrap();
    let texels: Vec<u8> = (0..=255).cycle().take(16 * 16 * 4).collect();
    let result = run_kernel(
        &mut bridge,
        Arc::new(Passthrough),
        &source_desc(16, 16, TextureFormat::Rgba8Unorm),
        &texels,
        &result_desc(16, 16, TextureFormat::Rgba8Unorm),
        SharingStrategy::SameDevice,
    )
    .unwrap();
    assert_eq!(result, texels);
}

#[test]
fn boundary_sizes_pair_and_dispatch() {
    const MAX: u32 = 64;
    for strategy in STRATEGIES {
        for (width, height) in [(1, 1), (MAX, 1), (1, MAX), (MAX, MAX)] {
            let adapter = SoftAdapter::new(SoftAdapterConfig {
                max_texture_dimension: MAX,
                ..SoftAdapterConfig::default()
            });
            let mut bridge = soft_bridge(&adapter, strategy).unwrap();
            let texels = SourceImage::sample(width, height).rgba8;
            let result = run_kernel(
                &mut bridge,
                Arc::new(GrayscaleKernel),
                &source_desc(width, height, TextureFormat::Rgba8Unorm),
                &texels,
                &result_desc(width, height, TextureFormat::Rgba8Unorm),
                strategy,
            )
            .unwrap();
            assert_eq!(result.len(), texels.len());
        }

        let adapter = SoftAdapter::new(SoftAdapterConfig {
            max_texture_dimension: MAX,
            ..SoftAdapterConfig::default()
        });
        let mut bridge = soft_bridge(&adapter, strategy).unwrap();
        let oversized = bridge.create_aliased_pair(
            &source_desc(MAX + 1, 1, TextureFormat::Rgba8Unorm),
            &vec![0; (MAX as usize + 1) * 4],
            &result_desc(MAX + 1, 1, TextureFormat::Rgba8Unorm),
            strategy,
        );
        assert!(matches!(
            oversized,
            Err(InteropError::Capability {
                step: InteropStep::TextureAllocation,
                ..
            })
        ));
    }
}

#[test]
fn destroying_a_pair_drains_dispatch_without_read() {
    let adapter = SoftAdapter::new(SoftAdapterConfig::default());
    let mut bridge = soft_bridge(&adapter, SharingStrategy::CrossDevice).unwrap();
    let image = SourceImage::sample(8, 8);
    let pair = bridge
        .create_aliased_pair(
            &source_desc(8, 8, TextureFormat::Rgba8Unorm),
            &image.rgba8,
            &result_desc(8, 8, TextureFormat::Rgba8Unorm),
            SharingStrategy::CrossDevice,
        )
        .unwrap();
    let mut dispatcher = Dispatcher::new(Arc::new(GrayscaleKernel), &pair).unwrap();
    dispatcher.dispatch(bridge.compute_mut()).unwrap();

    bridge.destroy_pair(&pair).unwrap();
    assert_eq!(adapter.pending_work(), 0);
    adapter.drain().unwrap();
}

#[test]
fn kernel_samples_when_grids_differ() {
    let adapter = SoftAdapter::new(SoftAdapterConfig::default());
    let mut bridge = soft_bridge(&adapter, SharingStrategy::SameDevice).unwrap();
    let texels = [255u8, 0, 0, 255].repeat(16);
    let result = run_kernel(
        &mut bridge,
        Arc::new(GrayscaleKernel),
        &source_desc(4, 4, TextureFormat::Rgba8Unorm),
        &texels,
        &result_desc(2, 2, TextureFormat::Rgba8Unorm),
        SharingStrategy::SameDevice,
    )
    .unwrap();
    assert_eq!(result, [76u8, 76, 76, 255].repeat(4));
}

// ---------------------------------------------------------------------------
// Frame loop
// ---------------------------------------------------------------------------

#[test]
fn repeated_frames_are_identical() {
    let adapter = SoftAdapter::new(SoftAdapterConfig::default());
    let image = SourceImage::sample(32, 16);
    let mut frames = orchestrator(&adapter, SharingStrategy::SameDevice, &image);
    let mut stats = stats();

    frames.render_frame(&mut stats).unwrap();
    let first = frames.read_last_presented().unwrap().unwrap();
    for _ in 0..5 {
        frames.render_frame(&mut stats).unwrap();
        assert_eq!(frames.read_last_presented().unwrap().unwrap(), first);
    }
    assert_eq!(frames.bridge().present().present_count(), 6);
}

#[test]
fn strategies_present_identical_frames() {
    let image = SourceImage::sample(24, 24);
    let mut presented = Vec::new();
    for strategy in STRATEGIES {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let mut frames = orchestrator(&adapter, strategy, &image);
        let mut stats = stats();
        for _ in 0..4 {
            frames.render_frame(&mut stats).unwrap();
        }
        presented.push(frames.read_last_presented().unwrap().unwrap());
    }
    assert_eq!(presented[0], presented[1]);
}

#[test]
fn fourth_frame_blocks_on_slot_zero() {
    let clock = Arc::new(ManualClock::new());
    for strategy in STRATEGIES {
        let adapter = SoftAdapter::new(SoftAdapterConfig {
            clock: Some(clock.clone()),
            work_cost: Duration::from_micros(100),
            ..SoftAdapterConfig::default()
        });
        let image = SourceImage::sample(8, 8);
        let mut frames = orchestrator(&adapter, strategy, &image);
        let mut stats = FrameStatsAccumulator::new(clock.clone());

        for expected_index in 0..3 {
            assert_eq!(frames.frame_index(), expected_index);
            frames.render_frame(&mut stats).unwrap();
        }
        assert_eq!(stats.fence_waits(), 0, "{}", strategy.name());
        assert!(frames
            .slots()
            .iter()
            .all(|slot| slot.state() == SlotState::Submitted));

        assert_eq!(frames.frame_index(), 0);
        frames.render_frame(&mut stats).unwrap();
        assert_eq!(stats.fence_waits(), 1, "{}", strategy.name());
        assert!(stats.fence_wait_time() > Duration::ZERO);
        assert_eq!(frames.slots()[0].fence_value, 4);
    }
}

#[test]
fn wait_idle_retires_every_slot() {
    let adapter = SoftAdapter::new(SoftAdapterConfig::default());
    let image = SourceImage::sample(8, 8);
    let mut frames = orchestrator(&adapter, SharingStrategy::CrossDevice, &image);
    let mut stats = stats();
    frames.render_frame(&mut stats).unwrap();
    frames.render_frame(&mut stats).unwrap();
    frames.wait_idle().unwrap();
    assert_eq!(adapter.pending_work(), 0);
    assert!(frames
        .slots()
        .iter()
        .all(|slot| slot.state() == SlotState::Idle));
}
