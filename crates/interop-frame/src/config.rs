//! Application configuration.

use std::path::PathBuf;

use anyhow::{bail, Result};
use gpu_interop::SharingStrategy;
use interop_core::TextureFormat;

/// Frames in flight.
pub const DEFAULT_FRAME_COUNT: u32 = 3;

/// Size of the bundled procedural image used when no image is given.
pub const SAMPLE_IMAGE_SIZE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteropConfig {
    pub strategy: SharingStrategy,
    /// Number of frame slots, and of swap chain buffers.
    pub frame_count: u32,
    /// Source image. `None` selects the bundled sample.
    pub image: Option<PathBuf>,
    /// Frames to render before shutting down. `None` runs `3 * frame_count + 1`.
    pub frames: Option<u64>,
    /// Save the last presented frame here on shutdown.
    pub screenshot: Option<PathBuf>,
    pub debug_layer: bool,
    pub source_format: TextureFormat,
    /// Also the swap chain format: the result is copied into back buffers
    /// as-is.
    pub result_format: TextureFormat,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            strategy: SharingStrategy::SameDevice,
            frame_count: DEFAULT_FRAME_COUNT,
            image: None,
            frames: None,
            screenshot: None,
            debug_layer: false,
            source_format: TextureFormat::Rgba8Unorm,
            result_format: TextureFormat::Rgba8Unorm,
        }
    }
}

impl InteropConfig {
    /// Frames to render: enough to rotate through every slot at least three
    /// times and block on one.
    pub fn frames(&self) -> u64 {
        self.frames.unwrap_or(3 * u64::from(self.frame_count) + 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_count == 0 {
            bail!("frame count must be at least 1");
        }
        if self.frame_count > 16 {
            bail!("frame count {} exceeds the swap chain limit of 16", self.frame_count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_one_frame_past_three_rotations() {
        let config = InteropConfig::default();
        assert_eq!(config.frame_count, 3);
        assert_eq!(config.frames(), 10);
        assert_eq!(config.strategy, SharingStrategy::SameDevice);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_frame_slots() {
        let config = InteropConfig {
            frame_count: 0,
            ..InteropConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
