//! Grayscale an image with a compute kernel on one runtime and present it
//! through another, sharing the textures either on one device or across two.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gpu_interop::soft::{SoftAdapter, SoftAdapterConfig};
use gpu_interop::{ComputeRuntime, InteropBridge, SharingStrategy};
use interop_core::{SystemClock, TextureFormat};
use interop_frame::backend::soft_bridge;
use interop_frame::{InteropApp, InteropConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// D3D12 presentation with D3D11 compute (Windows only)
    D3d12,
    /// Deterministic in-process software runtimes
    Soft,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "windows") {
            Self::D3d12
        } else {
            Self::Soft
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Rgba8,
    Bgra8,
    Rgba16,
}

impl From<Format> for TextureFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Rgba8 => TextureFormat::Rgba8Unorm,
            Format::Bgra8 => TextureFormat::Bgra8Unorm,
            Format::Rgba16 => TextureFormat::Rgba16Unorm,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "interop-grayscale",
    about = "Grayscale an image with D3D11 compute and present it with D3D12."
)]
struct Args {
    /// PNG to process (defaults to a generated sample)
    #[arg(short, long, value_name = "PATH")]
    image: Option<PathBuf>,

    /// Use a separate compute device and share textures through exported handles
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    native: bool,

    /// Runtime backend
    #[arg(long, value_enum, default_value_t = Backend::default())]
    backend: Backend,

    /// Frames in flight
    #[arg(long, default_value_t = interop_frame::config::DEFAULT_FRAME_COUNT)]
    frame_count: u32,

    /// Frames to render before exiting (defaults to 3 * frame-count + 1)
    #[arg(long)]
    frames: Option<u64>,

    /// Save the last presented frame as PNG on shutdown
    #[arg(long, value_name = "PATH")]
    screenshot: Option<PathBuf>,

    /// Enable the D3D12 debug layer
    #[arg(long, action = clap::ArgAction::SetTrue)]
    debug_layer: bool,

    /// Source texture format
    #[arg(long, value_enum, default_value_t = Format::Rgba8)]
    source_format: Format,

    /// Result and swap chain format
    #[arg(long, value_enum, default_value_t = Format::Rgba8)]
    result_format: Format,
}

impl Args {
    fn config(&self) -> InteropConfig {
        InteropConfig {
            strategy: if self.native {
                SharingStrategy::CrossDevice
            } else {
                SharingStrategy::SameDevice
            },
            frame_count: self.frame_count,
            image: self.image.clone(),
            frames: self.frames,
            screenshot: self.screenshot.clone(),
            debug_layer: self.debug_layer,
            source_format: self.source_format.into(),
            result_format: self.result_format.into(),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = args.config();
    config.validate()?;
    info!("Backend {:?}, {}", args.backend, config.strategy.name());

    match args.backend {
        Backend::Soft => {
            let adapter = SoftAdapter::new(SoftAdapterConfig::default());
            let bridge = soft_bridge(&adapter, config.strategy).context("create soft runtimes")?;
            run_app(config, bridge)
        }
        Backend::D3d12 => run_d3d12(config),
    }
}

#[cfg(target_os = "windows")]
fn run_d3d12(config: InteropConfig) -> Result<()> {
    use gpu_interop::d3d12::D3d12Options;

    let options = D3d12Options {
        debug_layer: config.debug_layer,
        ..D3d12Options::default()
    };
    let bridge = interop_frame::backend::d3d12_bridge(options, config.strategy)
        .context("create D3D12/D3D11 runtimes")?;
    run_app(config, bridge)
}

#[cfg(not(target_os = "windows"))]
fn run_d3d12(_config: InteropConfig) -> Result<()> {
    anyhow::bail!("the d3d12 backend is only available on Windows; use --backend soft")
}

fn run_app<C: ComputeRuntime>(config: InteropConfig, bridge: InteropBridge<C>) -> Result<()> {
    let mut app = InteropApp::new(config, Arc::new(SystemClock::new()))?;
    app.init(bridge)?;
    info!("{}", app.window_title());
    app.run()?;
    app.destroy()?;
    info!(
        "Done: {} frame(s), {:?} spent waiting on frame fences",
        app.stats().frame_count(),
        app.stats().fence_wait_time()
    );
    Ok(())
}
