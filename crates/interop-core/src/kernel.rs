//! Per-texel compute kernels.
//!
//! A kernel maps one source texture to one result texture. Each invocation
//! returns the texel for its own result cell and has no other side effects,
//! so any launch order (or none at all for a skipped frame) is valid.

use crate::format::{Extent, TextureFormat};
use crate::texel::{Texel, TexelView};

/// Luminance weights for the reference grayscale conversion.
pub const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Luminance of a texel's color channels. Alpha is ignored.
pub fn luminance(texel: Texel) -> f32 {
    LUMA_WEIGHTS[0] * texel.r + LUMA_WEIGHTS[1] * texel.g + LUMA_WEIGHTS[2] * texel.b
}

/// A data-parallel function over result texels.
///
/// Backends that execute on real hardware use [`Kernel::hlsl`]; backends that
/// run on the host call [`Kernel::shade`] once per result texel.
pub trait Kernel: Send + Sync {
    /// Stable name, used as a cache key for compiled shaders.
    fn name(&self) -> &str;

    /// Result texel at `(x, y)` of a result texture of size `result`.
    fn shade(&self, source: &TexelView<'_>, x: u32, y: u32, result: Extent) -> Texel;

    /// HLSL compute shader source with a `main` entry point, bound as
    /// `t0` source, `u0` result and `s0` linear-clamp sampler.
    fn hlsl(&self) -> Option<&'static str> {
        None
    }

    /// Thread-group size the HLSL entry point declares.
    fn group_size(&self) -> (u32, u32) {
        (8, 8)
    }
}

/// Writes every result texel as its luminance, preserving alpha.
///
/// When source and result sizes match, each result texel reads the
/// corresponding source texel. Otherwise the source is sampled with bilinear
/// filtering at the result texel's center in normalized coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscaleKernel;

impl Kernel for GrayscaleKernel {
    fn name(&self) -> &str {
        "grayscale"
    }

    fn shade(&self, source: &TexelView<'_>, x: u32, y: u32, result: Extent) -> Texel {
        let texel = if source.extent() == result {
            source.load(x, y)
        } else {
            source.sample_bilinear(
                (x as f32 + 0.5) / result.width as f32,
                (y as f32 + 0.5) / result.height as f32,
            )
        };
        let l = luminance(texel);
        Texel::new(l, l, l, texel.a)
    }

    fn hlsl(&self) -> Option<&'static str> {
        Some(include_str!("../shaders/grayscale.hlsl"))
    }
}

/// Run `kernel` over the whole result grid on the host.
///
/// Rows are split into contiguous bands, one per worker thread. `result` must
/// be exactly `extent` texels of `format`.
pub fn launch_grid(
    kernel: &dyn Kernel,
    source: &TexelView<'_>,
    result: &mut [u8],
    extent: Extent,
    format: TextureFormat,
    parallelism: usize,
) {
    let row_pitch = extent.width as usize * format.bytes_per_texel();
    if row_pitch == 0 || extent.height == 0 {
        return;
    }
    let bands = parallelism.clamp(1, extent.height as usize);
    let rows_per_band = (extent.height as usize).div_ceil(bands);

    let shade_rows = |first_row: usize, band: &mut [u8]| {
        for (i, row) in band.chunks_exact_mut(row_pitch).enumerate() {
            let y = (first_row + i) as u32;
            for (x, out) in row.chunks_exact_mut(format.bytes_per_texel()).enumerate() {
                let texel = kernel.shade(source, x as u32, y, extent);
                format.encode(texel, out);
            }
        }
    };

    if bands == 1 {
        shade_rows(0, result);
        return;
    }

    std::thread::scope(|scope| {
        for (band_index, band) in result.chunks_mut(rows_per_band * row_pitch).enumerate() {
            let shade_rows = &shade_rows;
            scope.spawn(move || shade_rows(band_index * rows_per_band, band));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texel::quantize;
    use proptest::prelude::*;

    fn run(
        source: &[u8],
        source_extent: Extent,
        result_extent: Extent,
        parallelism: usize,
    ) -> Vec<u8> {
        let view = TexelView::new(source, source_extent, TextureFormat::Rgba8Unorm).unwrap();
        let mut out = vec![0u8; result_extent.texel_count() * 4];
        launch_grid(
            &GrayscaleKernel,
            &view,
            &mut out,
            result_extent,
            TextureFormat::Rgba8Unorm,
            parallelism,
        );
        out
    }

    #[test]
    fn opaque_red_becomes_76() {
        let out = run(&[255, 0, 0, 255], Extent::new(1, 1), Extent::new(1, 1), 1);
        assert_eq!(out, vec![76, 76, 76, 255]);
    }

    #[test]
    fn alpha_is_preserved() {
        let out = run(&[0, 255, 0, 17], Extent::new(1, 1), Extent::new(1, 1), 1);
        assert_eq!(out, vec![150, 150, 150, 17]);
    }

    #[test]
    fn uniform_source_stays_uniform_when_scaled() {
        let source: Vec<u8> = [10u8, 200, 30, 255].repeat(16);
        let out = run(&source, Extent::new(4, 4), Extent::new(7, 3), 2);
        let expected = quantize(
            luminance(Texel::new(10.0 / 255.0, 200.0 / 255.0, 30.0 / 255.0, 1.0)),
            8,
        ) as u8;
        for texel in out.chunks_exact(4) {
            assert_eq!(texel, [expected, expected, expected, 255]);
        }
    }

    #[test]
    fn grayscale_ships_hlsl() {
        let hlsl = GrayscaleKernel.hlsl().unwrap();
        assert!(hlsl.contains("numthreads(8, 8, 1)"));
    }

    proptest! {
        #[test]
        fn congruent_output_is_gray_with_source_alpha(
            pixels in proptest::collection::vec(any::<[u8; 4]>(), 12),
            parallelism in 1usize..5,
        ) {
            let source: Vec<u8> = pixels.iter().flatten().copied().collect();
            let extent = Extent::new(4, 3);
            let out = run(&source, extent, extent, parallelism);
            for (src, dst) in source.chunks_exact(4).zip(out.chunks_exact(4)) {
                let l = 0.299 * src[0] as f32 + 0.587 * src[1] as f32 + 0.114 * src[2] as f32;
                prop_assert_eq!(dst[0], dst[1]);
                prop_assert_eq!(dst[1], dst[2]);
                prop_assert!((dst[0] as f32 - l).abs() <= 1.0);
                prop_assert_eq!(dst[3], src[3]);
            }
        }

        #[test]
        fn band_split_does_not_change_results(
            pixels in proptest::collection::vec(any::<[u8; 4]>(), 20),
            parallelism in 2usize..8,
        ) {
            let source: Vec<u8> = pixels.iter().flatten().copied().collect();
            let serial = run(&source, Extent::new(5, 4), Extent::new(3, 6), 1);
            let parallel = run(&source, Extent::new(5, 4), Extent::new(3, 6), parallelism);
            prop_assert_eq!(serial, parallel);
        }
    }
}
