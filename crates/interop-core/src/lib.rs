//! Runtime-independent building blocks for cross-runtime texture interop.
//!
//! Nothing in this crate talks to a GPU. It defines the vocabulary both
//! runtimes agree on:
//!
//! - [`TextureDesc`] / [`TextureFormat`] / [`UsageFlags`] / [`SharingMode`]
//!   describe a logical texture independently of which runtime holds it.
//! - [`Texel`] and [`TexelView`] give typed access to normalized texel data,
//!   including re-quantization to each format's storage precision.
//! - [`Kernel`] is the plug-in contract for per-texel compute work, with
//!   [`GrayscaleKernel`] as the reference kernel.
//! - [`InteropError`] is the error taxonomy shared by every layer above.
//! - [`SourceImage`] is the image-source collaborator (PNG or a bundled
//!   procedural sample).
//! - [`Clock`] abstracts time so fence waits can be measured in tests.

pub mod clock;
pub mod error;
pub mod format;
pub mod image;
pub mod kernel;
pub mod texel;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{InteropError, InteropStep, Result};
pub use format::{Extent, SharingMode, TextureDesc, TextureFormat, UsageFlags};
pub use image::{ImageError, SourceImage};
pub use kernel::{launch_grid, luminance, GrayscaleKernel, Kernel};
pub use texel::{Texel, TexelView};
