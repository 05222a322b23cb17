//! Normalized texels and typed read access to texel storage.

use crate::format::{Extent, TextureFormat};

/// A 4-channel texel with components nominally in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Texel {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Texel {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn lerp(self, other: Texel, t: f32) -> Texel {
        Texel {
            r: self.r + (other.r - self.r) * t,
            g: self.g + (other.g - self.g) * t,
            b: self.b + (other.b - self.b) * t,
            a: self.a + (other.a - self.a) * t,
        }
    }
}

/// Convert a float to an unsigned normalized integer of `bits` width:
/// clamp to `[0, 1]`, scale, round to nearest.
pub fn quantize(value: f32, bits: u32) -> u32 {
    let max = ((1u64 << bits) - 1) as f32;
    (value.clamp(0.0, 1.0) * max).round() as u32
}

pub fn dequantize(value: u32, bits: u32) -> f32 {
    let max = ((1u64 << bits) - 1) as f32;
    value as f32 / max
}

impl TextureFormat {
    /// Decode one texel from its storage bytes.
    pub fn decode(self, bytes: &[u8]) -> Texel {
        match self {
            Self::Rgba8Unorm => Texel::new(
                dequantize(bytes[0] as u32, 8),
                dequantize(bytes[1] as u32, 8),
                dequantize(bytes[2] as u32, 8),
                dequantize(bytes[3] as u32, 8),
            ),
            Self::Bgra8Unorm => Texel::new(
                dequantize(bytes[2] as u32, 8),
                dequantize(bytes[1] as u32, 8),
                dequantize(bytes[0] as u32, 8),
                dequantize(bytes[3] as u32, 8),
            ),
            Self::Rgba16Unorm => {
                let channel = |i: usize| {
                    dequantize(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]) as u32, 16)
                };
                Texel::new(channel(0), channel(1), channel(2), channel(3))
            }
        }
    }

    /// Re-quantize `texel` to this format's storage precision.
    pub fn encode(self, texel: Texel, out: &mut [u8]) {
        match self {
            Self::Rgba8Unorm => {
                out[0] = quantize(texel.r, 8) as u8;
                out[1] = quantize(texel.g, 8) as u8;
                out[2] = quantize(texel.b, 8) as u8;
                out[3] = quantize(texel.a, 8) as u8;
            }
            Self::Bgra8Unorm => {
                out[0] = quantize(texel.b, 8) as u8;
                out[1] = quantize(texel.g, 8) as u8;
                out[2] = quantize(texel.r, 8) as u8;
                out[3] = quantize(texel.a, 8) as u8;
            }
            Self::Rgba16Unorm => {
                for (i, value) in [texel.r, texel.g, texel.b, texel.a].into_iter().enumerate() {
                    let q = quantize(value, 16) as u16;
                    out[i * 2..i * 2 + 2].copy_from_slice(&q.to_le_bytes());
                }
            }
        }
    }
}

/// Read-only typed view over tightly packed texel storage.
#[derive(Clone, Copy)]
pub struct TexelView<'a> {
    bytes: &'a [u8],
    extent: Extent,
    format: TextureFormat,
}

impl<'a> TexelView<'a> {
    /// Returns `None` if `bytes` is not exactly `extent` texels of `format`.
    pub fn new(bytes: &'a [u8], extent: Extent, format: TextureFormat) -> Option<Self> {
        if bytes.len() != extent.texel_count() * format.bytes_per_texel() {
            return None;
        }
        Some(Self {
            bytes,
            extent,
            format,
        })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Texel at integer coordinates, clamped to the edge.
    pub fn load(&self, x: u32, y: u32) -> Texel {
        let x = x.min(self.extent.width - 1) as usize;
        let y = y.min(self.extent.height - 1) as usize;
        let bpt = self.format.bytes_per_texel();
        let offset = (y * self.extent.width as usize + x) * bpt;
        self.format.decode(&self.bytes[offset..offset + bpt])
    }

    /// Bilinear sample at normalized coordinates with texel-center addressing
    /// and clamp-to-edge.
    pub fn sample_bilinear(&self, u: f32, v: f32) -> Texel {
        let fx = (u * self.extent.width as f32 - 0.5).max(0.0);
        let fy = (v * self.extent.height as f32 - 0.5).max(0.0);
        let x0 = fx.floor() as u32;
        let y0 = fy.floor() as u32;
        let tx = fx - x0 as f32;
        let ty = fy - y0 as f32;

        let top = self.load(x0, y0).lerp(self.load(x0 + 1, y0), tx);
        let bottom = self.load(x0, y0 + 1).lerp(self.load(x0 + 1, y0 + 1), tx);
        top.lerp(bottom, ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_to_nearest_and_clamps() {
        assert_eq!(quantize(0.299, 8), 76);
        assert_eq!(quantize(1.5, 8), 255);
        assert_eq!(quantize(-0.2, 8), 0);
        assert_eq!(quantize(1.0, 16), 65535);
    }

    #[test]
    fn bgra_swizzles_red_and_blue() {
        let mut out = [0u8; 4];
        TextureFormat::Bgra8Unorm.encode(Texel::new(1.0, 0.0, 0.0, 1.0), &mut out);
        assert_eq!(out, [0, 0, 255, 255]);
        let back = TextureFormat::Bgra8Unorm.decode(&out);
        assert_eq!(back, Texel::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn bilinear_hits_texel_centers_exactly() {
        // 2x1: black, white
        let bytes = [0, 0, 0, 255, 255, 255, 255, 255];
        let view = TexelView::new(&bytes, Extent::new(2, 1), TextureFormat::Rgba8Unorm).unwrap();
        assert_eq!(view.sample_bilinear(0.25, 0.5).r, 0.0);
        assert_eq!(view.sample_bilinear(0.75, 0.5).r, 1.0);
        assert!((view.sample_bilinear(0.5, 0.5).r - 0.5).abs() < 1e-6);
        // clamp beyond the edge
        assert_eq!(view.sample_bilinear(1.0, 0.5).r, 1.0);
    }

    #[test]
    fn view_rejects_wrong_length() {
        assert!(TexelView::new(&[0; 7], Extent::new(2, 1), TextureFormat::Rgba8Unorm).is_none());
    }
}
