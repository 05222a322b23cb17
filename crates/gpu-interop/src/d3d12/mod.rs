//! D3D12 presentation with D3D11 compute (Windows only).
//!
//! [`D3d12PresentDevice`] is Runtime A: it picks an adapter, owns every
//! texture, records copy/barrier command lists and presents through a DXGI
//! swap chain (or offscreen targets when no window is given).
//!
//! [`D3d11ComputeDevice`] is Runtime B, created either layered on the D3D12
//! device through D3D11On12 (resources are wrapped) or as a native D3D11
//! device on the same adapter (resources arrive as NT shared handles).

pub mod compute;
pub mod device;
pub mod present;

pub use compute::D3d11ComputeDevice;
pub use device::D3d12Device;
pub use present::{D3d12Options, D3d12PresentDevice};

use windows::Win32::Foundation::HANDLE;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use interop_core::{InteropError, InteropStep, TextureFormat};

use crate::runtime::{ResourceState, SharedHandle};

pub(crate) fn dxgi_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        TextureFormat::Rgba16Unorm => DXGI_FORMAT_R16G16B16A16_UNORM,
    }
}

pub(crate) fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::NonPixelShaderResource => D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
    }
}

pub(crate) fn to_shared(handle: HANDLE) -> SharedHandle {
    SharedHandle(handle.0 as usize as u64)
}

pub(crate) fn from_shared(handle: SharedHandle) -> HANDLE {
    HANDLE(handle.0 as usize as *mut _)
}

/// Map a failed driver call to a resource-creation error for `step`.
pub(crate) fn creation(
    step: InteropStep,
    what: &'static str,
) -> impl FnOnce(windows::core::Error) -> InteropError {
    move |e| InteropError::resource(step, format!("{what}: {e}"))
}

/// Map a failed driver call to a submission error for `step`.
pub(crate) fn submission(
    step: InteropStep,
    what: &'static str,
) -> impl FnOnce(windows::core::Error) -> InteropError {
    move |e| InteropError::submission(step, format!("{what}: {e}"))
}

/// Null out-parameter after a call reported success.
pub(crate) fn returned_null(step: InteropStep, what: &'static str) -> impl FnOnce() -> InteropError {
    move || InteropError::resource(step, format!("{what} returned null"))
}
