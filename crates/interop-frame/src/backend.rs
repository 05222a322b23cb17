//! Runtime construction for each backend and sharing strategy.

use gpu_interop::soft::{SoftAdapter, SoftComputeDevice, SoftPresentDevice};
use gpu_interop::{InteropBridge, SharingStrategy};
use interop_core::Result;

/// Software runtimes on `adapter`: a layered compute device for same-device
/// wrapping, an independent one for cross-device sharing.
pub fn soft_bridge(
    adapter: &SoftAdapter,
    strategy: SharingStrategy,
) -> Result<InteropBridge<SoftComputeDevice>> {
    let present = SoftPresentDevice::new(adapter);
    let compute = match strategy {
        SharingStrategy::SameDevice => SoftComputeDevice::layered(&present),
        SharingStrategy::CrossDevice => SoftComputeDevice::native(adapter),
    };
    InteropBridge::new(present, compute)
}

/// D3D12 presentation with D3D11 compute, layered through D3D11On12 or as a
/// native device on the same adapter.
#[cfg(target_os = "windows")]
pub fn d3d12_bridge(
    options: gpu_interop::d3d12::D3d12Options,
    strategy: SharingStrategy,
) -> Result<InteropBridge<gpu_interop::d3d12::D3d11ComputeDevice>> {
    use gpu_interop::d3d12::{D3d11ComputeDevice, D3d12PresentDevice};

    let present = D3d12PresentDevice::new(options)?;
    let compute = match strategy {
        SharingStrategy::SameDevice => D3d11ComputeDevice::layered(&present)?,
        SharingStrategy::CrossDevice => D3d11ComputeDevice::native(&present)?,
    };
    InteropBridge::new(present, compute)
}
