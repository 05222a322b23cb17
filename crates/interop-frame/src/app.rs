//! Application lifecycle.
//!
//! [`InteropApp`] is a plain state machine: `init` builds the aliased pair
//! and the frame orchestrator, `update` and `render` run once per frame,
//! `key_up` handles input, and `destroy` drains the GPU and tears everything
//! down. The window and message pump are the caller's; [`InteropApp::run`]
//! drives a fixed number of frames headless.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use gpu_interop::{ComputeRuntime, InteropBridge, PresentRuntime};
use interop_core::{Clock, GrayscaleKernel, SourceImage, TextureDesc, UsageFlags};
use tracing::{debug, error, info};

use crate::config::{InteropConfig, SAMPLE_IMAGE_SIZE};
use crate::orchestrator::FrameOrchestrator;
use crate::stats::FrameStatsAccumulator;

const TITLE: &str = "Cross-Runtime Interop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Pause or resume the timer.
    Space,
    /// Show or hide the frame rate.
    F1,
    /// Request shutdown.
    Escape,
}

enum Stage<C: ComputeRuntime> {
    Created,
    Running(Box<FrameOrchestrator<C>>),
    Destroyed,
}

pub struct InteropApp<C: ComputeRuntime> {
    config: InteropConfig,
    stats: FrameStatsAccumulator,
    stage: Stage<C>,
    title: String,
    quit: bool,
}

impl<C: ComputeRuntime> InteropApp<C> {
    pub fn new(config: InteropConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stats: FrameStatsAccumulator::new(clock),
            stage: Stage::Created,
            title: TITLE.to_string(),
            quit: false,
        })
    }

    /// Load the source image, create the aliased pair on `bridge` and start
    /// the frame orchestrator.
    pub fn init(&mut self, mut bridge: InteropBridge<C>) -> Result<()> {
        if !matches!(self.stage, Stage::Created) {
            bail!("init called twice");
        }

        let image = match &self.config.image {
            Some(path) => SourceImage::open(path)
                .with_context(|| format!("load source image {}", path.display()))?,
            None => SourceImage::sample(SAMPLE_IMAGE_SIZE, SAMPLE_IMAGE_SIZE),
        };
        let source = TextureDesc::new(image.width, image.height, self.config.source_format)
            .with_usage(UsageFlags::SHADER_READ);
        let result = TextureDesc::new(image.width, image.height, self.config.result_format)
            .with_usage(UsageFlags::UNORDERED_WRITE);

        let strategy = self.config.strategy;
        let pair = bridge
            .create_aliased_pair(
                &source,
                &image.to_format(source.format),
                &result,
                strategy,
            )
            .with_context(|| format!("create {} texture pair", strategy.name()))?;

        let adapter = bridge.present().adapter();
        self.title = format!("{TITLE} ({}){}", strategy.name(), adapter.title_suffix());
        info!(
            "{}x{} image on '{}' using {}",
            image.width,
            image.height,
            adapter.name,
            strategy.name()
        );

        let orchestrator = FrameOrchestrator::new(
            bridge,
            pair,
            Arc::new(GrayscaleKernel),
            self.config.frame_count,
        )
        .context("create frame orchestrator")?;
        self.stage = Stage::Running(Box::new(orchestrator));
        Ok(())
    }

    pub fn update(&mut self) {
        self.stats.tick();
    }

    pub fn render(&mut self) -> Result<()> {
        let orchestrator = match &mut self.stage {
            Stage::Running(orchestrator) => orchestrator,
            Stage::Created => bail!("render before init"),
            Stage::Destroyed => bail!("render after destroy"),
        };
        orchestrator
            .render_frame(&mut self.stats)
            .context("render frame")
    }

    pub fn key_up(&mut self, key: Key) {
        match key {
            Key::Space => self.stats.toggle_pause(),
            Key::F1 => self.stats.toggle_fps(),
            Key::Escape => self.quit = true,
        }
        debug!("Key {key:?} released");
    }

    /// Drain the GPU, save the screenshot if one was configured and release
    /// every runtime object.
    pub fn destroy(&mut self) -> Result<()> {
        let stage = std::mem::replace(&mut self.stage, Stage::Destroyed);
        let Stage::Running(mut orchestrator) = stage else {
            return Ok(());
        };
        orchestrator.wait_idle().context("wait for the GPU")?;
        if let Some(path) = self.config.screenshot.clone() {
            let desc = orchestrator.pair().result.desc;
            let bytes = orchestrator
                .read_last_presented()
                .context("read back the last presented frame")?
                .ok_or_else(|| anyhow!("no frame was presented"))?;
            let image = SourceImage::from_texels(desc.extent(), desc.format, &bytes)
                .ok_or_else(|| anyhow!("back buffer size does not match the result"))?;
            image
                .save_png(&path)
                .with_context(|| format!("save screenshot {}", path.display()))?;
            info!("Saved screenshot to {}", path.display());
        }
        drop(orchestrator);
        Ok(())
    }

    /// Render the configured number of frames, or until Escape.
    pub fn run(&mut self) -> Result<()> {
        let frames = self.config.frames();
        for _ in 0..frames {
            if self.quit {
                break;
            }
            self.update();
            self.render()?;
        }
        info!(
            "Rendered {} frame(s), {} fence wait(s)",
            self.stats.frame_count(),
            self.stats.fence_waits()
        );
        Ok(())
    }

    pub fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub fn stats(&self) -> &FrameStatsAccumulator {
        &self.stats
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    /// Window title with the adapter suffix and the FPS overlay text.
    pub fn window_title(&self) -> String {
        format!("{} - {}", self.title, self.stats.fps_text())
    }

    pub fn orchestrator(&self) -> Option<&FrameOrchestrator<C>> {
        match &self.stage {
            Stage::Running(orchestrator) => Some(orchestrator.as_ref()),
            Stage::Created | Stage::Destroyed => None,
        }
    }

    pub fn orchestrator_mut(&mut self) -> Option<&mut FrameOrchestrator<C>> {
        match &mut self.stage {
            Stage::Running(orchestrator) => Some(orchestrator.as_mut()),
            Stage::Created | Stage::Destroyed => None,
        }
    }
}

impl<C: ComputeRuntime> Drop for InteropApp<C> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("Shutdown failed: {e:#}");
        }
    }
}
