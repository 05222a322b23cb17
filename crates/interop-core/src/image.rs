//! Source images and screenshot output.
//!
//! Images are always held as tightly packed RGBA8 and converted to a texture
//! format on upload.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::Path;

use crate::format::{Extent, TextureFormat};
use crate::texel::Texel;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to open {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode PNG: {0}")]
    Decode(#[from] png::DecodingError),
    #[error("failed to encode PNG: {0}")]
    Encode(#[from] png::EncodingError),
    #[error("unsupported image: {0}")]
    Unsupported(String),
}

/// A decoded image in RGBA8 layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub width: u32,
    pub height: u32,
    pub rgba8: Vec<u8>,
}

impl SourceImage {
    /// Returns `None` if `rgba8` is not exactly `width * height` texels.
    pub fn from_rgba8(width: u32, height: u32, rgba8: Vec<u8>) -> Option<Self> {
        (width > 0 && height > 0 && rgba8.len() == width as usize * height as usize * 4).then_some(
            Self {
                width,
                height,
                rgba8,
            },
        )
    }

    /// Bundled procedural image: horizontal hue sweep over a vertical
    /// brightness ramp, with a semi-transparent band in the lower quarter.
    pub fn sample(width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let mut rgba8 = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            let value = 1.0 - 0.75 * (y as f32 / height as f32);
            let alpha = if y >= height - height / 4 { 128 } else { 255 };
            for x in 0..width {
                let hue = x as f32 / width as f32 * 6.0;
                let [r, g, b] = hue_to_rgb(hue);
                rgba8.extend_from_slice(&[
                    (r * value * 255.0).round() as u8,
                    (g * value * 255.0).round() as u8,
                    (b * value * 255.0).round() as u8,
                    alpha,
                ]);
            }
        }
        Self {
            width,
            height,
            rgba8,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ImageError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::decode_png(BufReader::new(file))
    }

    pub fn decode_png_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        Self::decode_png(Cursor::new(bytes))
    }

    pub fn decode_png<R: std::io::BufRead + std::io::Seek>(reader: R) -> Result<Self, ImageError> {
        let mut decoder = png::Decoder::new(reader);
        decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
        let mut reader = decoder.read_info()?;

        let (width, height) = {
            let info = reader.info();
            (info.width, info.height)
        };
        let (color_type, bit_depth) = reader.output_color_type();
        if bit_depth != png::BitDepth::Eight {
            return Err(ImageError::Unsupported(format!(
                "{bit_depth:?} output after expansion"
            )));
        }
        let samples = color_type.samples();
        let mut buf = vec![0u8; width as usize * height as usize * samples];
        let frame = reader.next_frame(&mut buf)?;
        buf.truncate(frame.buffer_size());

        let rgba8 = match color_type {
            png::ColorType::Rgba => buf,
            png::ColorType::Rgb => buf
                .chunks_exact(3)
                .flat_map(|p| [p[0], p[1], p[2], 255])
                .collect(),
            png::ColorType::GrayscaleAlpha => buf
                .chunks_exact(2)
                .flat_map(|p| [p[0], p[0], p[0], p[1]])
                .collect(),
            png::ColorType::Grayscale => buf.iter().flat_map(|&l| [l, l, l, 255]).collect(),
            png::ColorType::Indexed => {
                return Err(ImageError::Unsupported(
                    "indexed color survived expansion".into(),
                ))
            }
        };

        Self::from_rgba8(width, height, rgba8).ok_or_else(|| {
            ImageError::Unsupported(format!("truncated {width}x{height} image data"))
        })
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    /// Texel data converted to `format`'s storage layout.
    pub fn to_format(&self, format: TextureFormat) -> Vec<u8> {
        if format == TextureFormat::Rgba8Unorm {
            return self.rgba8.clone();
        }
        let bpt = format.bytes_per_texel();
        let mut out = vec![0u8; self.extent().texel_count() * bpt];
        for (src, dst) in self.rgba8.chunks_exact(4).zip(out.chunks_exact_mut(bpt)) {
            format.encode(TextureFormat::Rgba8Unorm.decode(src), dst);
        }
        out
    }

    /// Build an image from texel data stored in `format`.
    pub fn from_texels(extent: Extent, format: TextureFormat, bytes: &[u8]) -> Option<Self> {
        let bpt = format.bytes_per_texel();
        if bytes.len() != extent.texel_count() * bpt {
            return None;
        }
        let mut rgba8 = vec![0u8; extent.texel_count() * 4];
        for (src, dst) in bytes.chunks_exact(bpt).zip(rgba8.chunks_exact_mut(4)) {
            TextureFormat::Rgba8Unorm.encode(format.decode(src), dst);
        }
        Self::from_rgba8(extent.width, extent.height, rgba8)
    }

    pub fn texel(&self, x: u32, y: u32) -> Texel {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        TextureFormat::Rgba8Unorm.decode(&self.rgba8[offset..offset + 4])
    }

    pub fn encode_png<W: Write>(&self, writer: W) -> Result<(), ImageError> {
        let mut encoder = png::Encoder::new(writer, self.width, self.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&self.rgba8)?;
        writer.finish()?;
        Ok(())
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| ImageError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.encode_png(BufWriter::new(file))
    }
}

fn hue_to_rgb(hue: f32) -> [f32; 3] {
    let x = 1.0 - ((hue % 2.0) - 1.0).abs();
    match hue as u32 {
        0 => [1.0, x, 0.0],
        1 => [x, 1.0, 0.0],
        2 => [0.0, 1.0, x],
        3 => [0.0, x, 1.0],
        4 => [x, 0.0, 1.0],
        _ => [1.0, 0.0, x],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn png_encode_then_decode_preserves_pixels() {
        let image = SourceImage::sample(13, 7);
        let mut bytes = Vec::new();
        image.encode_png(&mut bytes).unwrap();
        let decoded = SourceImage::decode_png_bytes(&bytes).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn rgb_png_gets_opaque_alpha() {
        let mut bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut bytes, 2, 1);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&[1, 2, 3, 4, 5, 6]).unwrap();
        }
        let decoded = SourceImage::decode_png_bytes(&bytes).unwrap();
        assert_eq!(decoded.rgba8, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn sample_has_translucent_band() {
        let image = SourceImage::sample(8, 8);
        assert_eq!(image.texel(0, 0).a, 1.0);
        assert!(image.texel(0, 7).a < 1.0);
    }

    #[test]
    fn format_conversion_swizzles_bgra() {
        let image = SourceImage::from_rgba8(1, 1, vec![10, 20, 30, 40]).unwrap();
        assert_eq!(image.to_format(TextureFormat::Bgra8Unorm), vec![30, 20, 10, 40]);
        let back = SourceImage::from_texels(
            image.extent(),
            TextureFormat::Rgba16Unorm,
            &image.to_format(TextureFormat::Rgba16Unorm),
        )
        .unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SourceImage::open("/nonexistent/picture.png").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/picture.png"));
    }
}
