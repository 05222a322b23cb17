//! D3D12 device, adapter selection and host-side fence waits.

use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use tracing::{debug, error, warn};

use interop_core::{InteropError, InteropStep, Result};

use super::{creation, submission};
use crate::runtime::AdapterInfo;

/// A D3D12 device with one direct queue, created on the first adapter that
/// supports feature level 11.0.
pub struct D3d12Device {
    factory: IDXGIFactory4,
    adapter: IDXGIAdapter1,
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    info: AdapterInfo,
}

impl D3d12Device {
    pub fn new(debug_layer: bool) -> Result<Self> {
        let mut factory_flags = DXGI_CREATE_FACTORY_FLAGS(0);
        if debug_layer {
            match enable_debug_layer() {
                Ok(()) => {
                    debug!("D3D12 debug layer enabled");
                    factory_flags = DXGI_CREATE_FACTORY_DEBUG;
                }
                Err(e) => warn!("D3D12 debug layer unavailable: {e}"),
            }
        }

        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(factory_flags) }
            .map_err(creation(InteropStep::DeviceCreation, "CreateDXGIFactory2"))?;

        let (adapter, device, info) = select_adapter(&factory)?;

        let queue_desc = D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        };
        let queue: ID3D12CommandQueue = unsafe { device.CreateCommandQueue(&queue_desc) }
            .map_err(creation(InteropStep::DeviceCreation, "CreateCommandQueue"))?;

        Ok(Self {
            factory,
            adapter,
            device,
            queue,
            info,
        })
    }

    pub fn factory(&self) -> &IDXGIFactory4 {
        &self.factory
    }

    /// The adapter the device was created on. A native compute device must
    /// be created on the same one to open shared handles.
    pub fn adapter(&self) -> &IDXGIAdapter1 {
        &self.adapter
    }

    pub fn device(&self) -> &ID3D12Device {
        &self.device
    }

    pub fn queue(&self) -> &ID3D12CommandQueue {
        &self.queue
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }
}

fn enable_debug_layer() -> windows::core::Result<()> {
    let mut debug: Option<ID3D12Debug> = None;
    unsafe { D3D12GetDebugInterface(&mut debug) }?;
    if let Some(debug) = debug {
        unsafe { debug.EnableDebugLayer() };
    }
    Ok(())
}

/// Try every adapter in enumeration order until one creates a device.
fn select_adapter(factory: &IDXGIFactory4) -> Result<(IDXGIAdapter1, ID3D12Device, AdapterInfo)> {
    let mut index = 0;
    loop {
        let adapter = match unsafe { factory.EnumAdapters1(index) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => {
                return Err(InteropError::capability(
                    InteropStep::AdapterSelection,
                    format!("EnumAdapters1({index}): {e}"),
                ))
            }
        };
        index += 1;

        let desc = match unsafe { adapter.GetDesc1() } {
            Ok(desc) => desc,
            Err(e) => {
                warn!("Skipping adapter {}: GetDesc1 failed: {e}", index - 1);
                continue;
            }
        };
        let info = adapter_info(&desc);

        let mut device: Option<ID3D12Device> = None;
        match unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) } {
            Ok(()) => {
                if let Some(device) = device {
                    debug!(
                        "D3D12 device on '{}' (vendor {:#06x}, device {:#06x}, software: {})",
                        info.name, info.vendor_id, info.device_id, info.software
                    );
                    return Ok((adapter, device, info));
                }
            }
            Err(e) => debug!("Adapter '{}' rejected feature level 11.0: {e}", info.name),
        }
    }

    error!("No adapter supports D3D12 at feature level 11.0");
    Err(InteropError::capability(
        InteropStep::AdapterSelection,
        "no adapter supports D3D12 at feature level 11.0",
    ))
}

fn adapter_info(desc: &DXGI_ADAPTER_DESC1) -> AdapterInfo {
    let len = desc
        .Description
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(desc.Description.len());
    AdapterInfo {
        name: String::from_utf16_lossy(&desc.Description[..len]),
        vendor_id: desc.VendorId,
        device_id: desc.DeviceId,
        software: desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0,
        max_texture_dimension: D3D12_REQ_TEXTURE2D_U_OR_V_DIMENSION,
    }
}

// ---------------------------------------------------------------------------
// HostFence
// ---------------------------------------------------------------------------

/// A fence plus the Win32 event the host blocks on.
pub(crate) struct HostFence {
    fence: ID3D12Fence,
    event: HANDLE,
    value: u64,
}

impl HostFence {
    pub fn new(device: &ID3D12Device) -> Result<Self> {
        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .map_err(creation(InteropStep::DeviceCreation, "CreateFence"))?;
        let event = unsafe { CreateEventW(None, false, false, None) }
            .map_err(creation(InteropStep::DeviceCreation, "CreateEventW"))?;
        Ok(Self {
            fence,
            event,
            value: 0,
        })
    }

    /// Signal the next value on `queue` and return it.
    pub fn signal(&mut self, queue: &ID3D12CommandQueue) -> Result<u64> {
        self.value += 1;
        unsafe { queue.Signal(&self.fence, self.value) }
            .map_err(submission(InteropStep::Submission, "ID3D12CommandQueue::Signal"))?;
        Ok(self.value)
    }

    pub fn completed(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    pub fn wait(&self, value: u64) -> Result<()> {
        wait_on(&self.fence, self.event, value)
    }

    /// Signal a fresh value and block until the queue reaches it.
    pub fn drain(&mut self, queue: &ID3D12CommandQueue) -> Result<()> {
        let value = self.signal(queue)?;
        self.wait(value)
    }

    pub fn event(&self) -> HANDLE {
        self.event
    }
}

impl Drop for HostFence {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}

/// Block until `fence` reaches `value`. No timeout.
pub(crate) fn wait_on(fence: &ID3D12Fence, event: HANDLE, value: u64) -> Result<()> {
    if unsafe { fence.GetCompletedValue() } >= value {
        return Ok(());
    }
    unsafe { fence.SetEventOnCompletion(value, event) }
        .map_err(submission(InteropStep::FenceWait, "SetEventOnCompletion"))?;
    let waited = unsafe { WaitForSingleObject(event, INFINITE) };
    if waited != WAIT_OBJECT_0 {
        return Err(InteropError::submission(
            InteropStep::FenceWait,
            format!("WaitForSingleObject returned {:#x}", waited.0),
        ));
    }
    Ok(())
}

/// Cast helper for APIs that take the base interface.
pub(crate) fn command_list(list: &ID3D12GraphicsCommandList) -> Result<ID3D12CommandList> {
    list.cast()
        .map_err(submission(InteropStep::Submission, "cast to ID3D12CommandList"))
}
