//! Logical texture descriptions.

use crate::error::{InteropError, InteropStep, Result};

/// Texel storage format. Every supported format is 4-channel normalized and
/// can be wrapped or shared by both runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Unorm,
}

impl TextureFormat {
    pub const ALL: [TextureFormat; 3] = [Self::Rgba8Unorm, Self::Bgra8Unorm, Self::Rgba16Unorm];

    pub const fn bytes_per_texel(self) -> usize {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm => 4,
            Self::Rgba16Unorm => 8,
        }
    }

    /// Bits of storage per channel.
    pub const fn channel_bits(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm => 8,
            Self::Rgba16Unorm => 16,
        }
    }
}

bitflags::bitflags! {
    /// How a logical texture may be bound.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UsageFlags: u8 {
        /// Readable from shaders (kernel input).
        const SHADER_READ = 1 << 0;
        /// Writable through an unordered-access view (kernel output).
        const UNORDERED_WRITE = 1 << 1;
        /// Eligible as a render target. Required for cross-device sharing.
        const RENDER_TARGET = 1 << 2;
    }
}

/// Which runtimes can see a logical texture's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SharingMode {
    /// Visible to the allocating runtime only.
    #[default]
    Private,
    /// Wrapped by a compute runtime layered on the same device.
    Aliased,
    /// Exported through an OS shared handle to an independent device.
    Exported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn texel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Description of a logical texture. Width and height are fixed for the
/// texture's whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mip_levels: u32,
    pub usage: UsageFlags,
    pub sharing: SharingMode,
}

impl TextureDesc {
    pub const fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
            usage: UsageFlags::empty(),
            sharing: SharingMode::Private,
        }
    }

    pub const fn with_usage(mut self, usage: UsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub const fn with_sharing(mut self, sharing: SharingMode) -> Self {
        self.sharing = sharing;
        self
    }

    pub const fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    pub const fn row_pitch(&self) -> usize {
        self.width as usize * self.format.bytes_per_texel()
    }

    pub const fn byte_len(&self) -> usize {
        self.row_pitch() * self.height as usize
    }

    /// Two descriptions describe the same memory layout (format, size, mips).
    /// Usage and sharing may differ between the runtimes' views.
    pub fn same_layout(&self, other: &TextureDesc) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.format == other.format
            && self.mip_levels == other.mip_levels
    }

    /// Check the description against an adapter's size limit.
    pub fn validate(&self, max_dimension: u32) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(InteropError::resource(
                InteropStep::TextureAllocation,
                format!("zero-sized texture {}x{}", self.width, self.height),
            ));
        }
        if self.width > max_dimension || self.height > max_dimension {
            return Err(InteropError::capability(
                InteropStep::TextureAllocation,
                format!(
                    "texture {}x{} exceeds the adapter limit of {max_dimension}",
                    self.width, self.height
                ),
            ));
        }
        if self.mip_levels != 1 {
            return Err(InteropError::capability(
                InteropStep::TextureAllocation,
                format!("{} mip levels requested, only 1 is supported", self.mip_levels),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_follows_format() {
        let desc = TextureDesc::new(3, 2, TextureFormat::Rgba16Unorm);
        assert_eq!(desc.row_pitch(), 24);
        assert_eq!(desc.byte_len(), 48);
    }

    #[test]
    fn validate_rejects_zero_and_oversized() {
        assert!(TextureDesc::new(0, 4, TextureFormat::Rgba8Unorm)
            .validate(16)
            .is_err());
        let err = TextureDesc::new(17, 1, TextureFormat::Rgba8Unorm)
            .validate(16)
            .unwrap_err();
        assert!(matches!(err, InteropError::Capability { .. }));
        assert!(TextureDesc::new(16, 1, TextureFormat::Rgba8Unorm)
            .validate(16)
            .is_ok());
    }

    #[test]
    fn layout_ignores_usage_and_sharing() {
        let a = TextureDesc::new(8, 8, TextureFormat::Bgra8Unorm).with_usage(UsageFlags::SHADER_READ);
        let b = a
            .with_usage(UsageFlags::RENDER_TARGET)
            .with_sharing(SharingMode::Exported);
        assert!(a.same_layout(&b));
        let mut c = b;
        c.mip_levels = 2;
        assert!(!a.same_layout(&c));
    }
}
