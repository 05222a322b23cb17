use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, GENERIC_ALL, HWND};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use tracing::{debug, warn};

use interop_core::{
    InteropError, InteropStep, Result, SharingMode, TextureDesc, TextureFormat, UsageFlags,
};

use super::device::{command_list, wait_on, D3d12Device, HostFence};
use super::{creation, dxgi_format, resource_state, returned_null, submission, to_shared};
use crate::runtime::{
    check_flip_swap_chain, AdapterInfo, Command, ContextId, FenceId, PresentRuntime,
    ResourceState, SharedAccess, SharedHandle, SharedHandleExport, TextureId,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct D3d12Options {
    pub debug_layer: bool,
    /// Present into this window. Without one, the swap chain is a ring of
    /// offscreen render targets.
    pub hwnd: Option<HWND>,
}

struct Texture {
    resource: ID3D12Resource,
    desc: TextureDesc,
}

struct Fence {
    fence: ID3D12Fence,
    shared: bool,
}

struct Context {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    recording: bool,
    /// Submission fence value that retires the last execute.
    retired_at: u64,
}

enum SwapChain {
    Window {
        chain: IDXGISwapChain3,
        buffers: Vec<TextureId>,
    },
    Offscreen {
        buffers: Vec<TextureId>,
        current: u32,
    },
}

impl SwapChain {
    fn buffers(&self) -> &[TextureId] {
        match self {
            Self::Window { buffers, .. } | Self::Offscreen { buffers, .. } => buffers,
        }
    }
}

/// Runtime A on D3D12.
pub struct D3d12PresentDevice {
    // Dropped last: everything below holds device children.
    device: D3d12Device,
    hwnd: Option<HWND>,
    next_id: u64,
    textures: HashMap<TextureId, Texture>,
    fences: HashMap<FenceId, Fence>,
    contexts: HashMap<ContextId, Context>,
    shared: Vec<SharedHandle>,
    swap_chain: Option<SwapChain>,
    /// Tracks submissions so contexts are never reset while in flight.
    submissions: HostFence,
    transfer_context: Option<ContextId>,
}

impl D3d12PresentDevice {
    pub fn new(options: D3d12Options) -> Result<Self> {
        let device = D3d12Device::new(options.debug_layer)?;
        let submissions = HostFence::new(device.device())?;
        Ok(Self {
            device,
            hwnd: options.hwnd,
            next_id: 0,
            textures: HashMap::new(),
            fences: HashMap::new(),
            contexts: HashMap::new(),
            shared: Vec::new(),
            swap_chain: None,
            submissions,
            transfer_context: None,
        })
    }

    pub fn device(&self) -> &D3d12Device {
        &self.device
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn texture(&self, texture: TextureId, step: InteropStep) -> Result<&Texture> {
        self.textures
            .get(&texture)
            .ok_or_else(|| InteropError::submission(step, format!("unknown texture {texture}")))
    }

    fn fence(&self, fence: FenceId) -> Result<&Fence> {
        self.fences.get(&fence).ok_or_else(|| {
            InteropError::submission(InteropStep::FenceWait, format!("unknown fence {fence}"))
        })
    }

    fn context(&mut self, context: ContextId) -> Result<&mut Context> {
        self.contexts.get_mut(&context).ok_or_else(|| {
            InteropError::submission(
                InteropStep::CommandRecording,
                format!("unknown command context {context}"),
            )
        })
    }

    fn insert_texture(&mut self, resource: ID3D12Resource, desc: TextureDesc) -> TextureId {
        let id = TextureId::from_raw(self.next_id());
        self.textures.insert(id, Texture { resource, desc });
        id
    }

    // -- Transfers ----------------------------------------------------------

    /// Record into the internal transfer context, execute it and wait for
    /// the queue to drain.
    fn transfer(&mut self, record: impl FnOnce(&ID3D12GraphicsCommandList)) -> Result<()> {
        let context = match self.transfer_context {
            Some(context) => context,
            None => {
                let context = self.create_command_context()?;
                self.transfer_context = Some(context);
                context
            }
        };
        self.reset_context(context)?;
        record(&self.context(context)?.list);
        self.close_context(context)?;
        self.execute(context)?;
        self.submissions.drain(self.device.queue())
    }

    fn footprint(&self, desc: &D3D12_RESOURCE_DESC) -> (D3D12_PLACED_SUBRESOURCE_FOOTPRINT, u32, u64) {
        let mut layout = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
        let mut rows = 0u32;
        let mut total = 0u64;
        unsafe {
            self.device.device().GetCopyableFootprints(
                desc,
                0,
                1,
                0,
                Some(&mut layout as *mut _),
                Some(&mut rows as *mut _),
                None,
                Some(&mut total as *mut _),
            );
        }
        (layout, rows, total)
    }

    fn buffer(&self, size: u64, heap: D3D12_HEAP_TYPE, state: D3D12_RESOURCE_STATES) -> Result<ID3D12Resource> {
        let heap_props = D3D12_HEAP_PROPERTIES {
            Type: heap,
            ..Default::default()
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            ..Default::default()
        };
        let mut buffer: Option<ID3D12Resource> = None;
        unsafe {
            self.device.device().CreateCommittedResource(
                &heap_props,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                state,
                None,
                &mut buffer,
            )
        }
        .map_err(creation(InteropStep::TextureAllocation, "CreateCommittedResource(buffer)"))?;
        buffer.ok_or_else(returned_null(InteropStep::TextureAllocation, "CreateCommittedResource"))
    }

    fn upload(
        &mut self,
        resource: &ID3D12Resource,
        desc: &TextureDesc,
        bytes: &[u8],
        state: ResourceState,
    ) -> Result<()> {
        let (layout, rows, total) = self.footprint(&unsafe { resource.GetDesc() });
        let staging = self.buffer(total, D3D12_HEAP_TYPE_UPLOAD, D3D12_RESOURCE_STATE_GENERIC_READ)?;

        let row_bytes = desc.row_pitch();
        let mut mapped: *mut c_void = std::ptr::null_mut();
        unsafe { staging.Map(0, None, Some(&mut mapped as *mut _)) }
            .map_err(creation(InteropStep::TextureAllocation, "Map(upload)"))?;
        for row in 0..rows as usize {
            let src = &bytes[row * row_bytes..(row + 1) * row_bytes];
            unsafe {
                let dst = (mapped as *mut u8)
                    .add(layout.Offset as usize + row * layout.Footprint.RowPitch as usize);
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst, row_bytes);
            }
        }
        unsafe { staging.Unmap(0, None) };

        let dst = subresource_location(resource);
        let src = footprint_location(&staging, layout);
        let after = resource_state(state);
        self.transfer(|list| unsafe {
            list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
            if after != D3D12_RESOURCE_STATE_COPY_DEST {
                list.ResourceBarrier(&[transition(resource, D3D12_RESOURCE_STATE_COPY_DEST, after)]);
            }
        })
    }

    // -- Swap chain ---------------------------------------------------------

    fn window_chain(
        &mut self,
        hwnd: HWND,
        desc: &TextureDesc,
        buffer_count: u32,
    ) -> Result<SwapChain> {
        let chain_desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: desc.width,
            Height: desc.height,
            Format: dxgi_format(desc.format),
            BufferCount: buffer_count,
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            ..Default::default()
        };
        let factory = self.device.factory();
        let chain: IDXGISwapChain3 = unsafe {
            factory.CreateSwapChainForHwnd(self.device.queue(), hwnd, &chain_desc, None, None)
        }
        .and_then(|chain| windows::core::Interface::cast(&chain))
        .map_err(creation(InteropStep::Present, "CreateSwapChainForHwnd"))?;
        unsafe { factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }
            .map_err(creation(InteropStep::Present, "MakeWindowAssociation"))?;

        let mut buffers = Vec::with_capacity(buffer_count as usize);
        for index in 0..buffer_count {
            let resource: ID3D12Resource = unsafe { chain.GetBuffer(index) }
                .map_err(creation(InteropStep::Present, "IDXGISwapChain::GetBuffer"))?;
            buffers.push(self.insert_texture(resource, *desc));
        }
        Ok(SwapChain::Window { chain, buffers })
    }

    fn offscreen_chain(&mut self, desc: &TextureDesc, buffer_count: u32) -> Result<SwapChain> {
        let buffers = (0..buffer_count)
            .map(|_| self.create_texture(desc, None, ResourceState::Present))
            .collect::<Result<Vec<_>>>()?;
        Ok(SwapChain::Offscreen {
            buffers,
            current: 0,
        })
    }
}

impl PresentRuntime for D3d12PresentDevice {
    type Resource = ID3D12Resource;

    fn adapter(&self) -> &AdapterInfo {
        self.device.info()
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: Option<&[u8]>,
        state: ResourceState,
    ) -> Result<TextureId> {
        desc.validate(self.device.info().max_texture_dimension)?;
        if let Some(bytes) = initial {
            if bytes.len() != desc.byte_len() {
                return Err(InteropError::resource(
                    InteropStep::TextureAllocation,
                    format!(
                        "initial data is {} bytes, the texture needs {}",
                        bytes.len(),
                        desc.byte_len()
                    ),
                ));
            }
        }

        let mut flags = D3D12_RESOURCE_FLAG_NONE;
        if desc.usage.contains(UsageFlags::UNORDERED_WRITE) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
        }
        if desc.usage.contains(UsageFlags::RENDER_TARGET) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
        }
        let heap_flags = match desc.sharing {
            SharingMode::Exported => D3D12_HEAP_FLAG_SHARED,
            SharingMode::Private | SharingMode::Aliased => D3D12_HEAP_FLAG_NONE,
        };
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: desc.width as u64,
            Height: desc.height,
            DepthOrArraySize: 1,
            MipLevels: desc.mip_levels as u16,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: flags,
        };
        let heap_props = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let initial_state = if initial.is_some() {
            D3D12_RESOURCE_STATE_COPY_DEST
        } else {
            resource_state(state)
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.device().CreateCommittedResource(
                &heap_props,
                heap_flags,
                &resource_desc,
                initial_state,
                None,
                &mut resource,
            )
        }
        .map_err(creation(InteropStep::TextureAllocation, "CreateCommittedResource"))?;
        let resource = resource
            .ok_or_else(returned_null(InteropStep::TextureAllocation, "CreateCommittedResource"))?;

        if let Some(bytes) = initial {
            self.upload(&resource, desc, bytes, state)?;
        }
        Ok(self.insert_texture(resource, *desc))
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc> {
        Ok(self.texture(texture, InteropStep::TextureAllocation)?.desc)
    }

    fn resource(&self, texture: TextureId) -> Result<ID3D12Resource> {
        Ok(self.texture(texture, InteropStep::DeviceWrap)?.resource.clone())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn export_shared(
        &mut self,
        texture: TextureId,
        access: SharedAccess,
    ) -> Result<SharedHandleExport> {
        let entry = self.texture(texture, InteropStep::HandleExport)?;
        let desc = entry.desc;
        if !desc.usage.contains(UsageFlags::RENDER_TARGET) {
            return Err(InteropError::capability(
                InteropStep::HandleExport,
                "only render-target textures can be shared across devices",
            ));
        }
        if desc.sharing != SharingMode::Exported {
            return Err(InteropError::resource(
                InteropStep::HandleExport,
                format!("{texture} was not allocated on a shared heap"),
            ));
        }
        // D3D12 only accepts GENERIC_ALL; the requested access is carried in
        // the export for the importing side.
        let handle = unsafe {
            self.device
                .device()
                .CreateSharedHandle(&entry.resource, None, GENERIC_ALL.0, PCWSTR::null())
        }
        .map_err(creation(InteropStep::HandleExport, "CreateSharedHandle"))?;
        let handle = to_shared(handle);
        self.shared.push(handle);
        debug!("Exported {texture} as shared handle {:#x}", handle.0);
        Ok(SharedHandleExport {
            handle,
            access,
            desc,
        })
    }

    fn close_shared(&mut self, handle: SharedHandle) {
        if let Some(index) = self.shared.iter().position(|&h| h == handle) {
            self.shared.swap_remove(index);
            unsafe {
                let _ = CloseHandle(super::from_shared(handle));
            }
        }
    }

    fn create_fence(&mut self, initial: u64, shared: bool) -> Result<FenceId> {
        let flags = if shared {
            D3D12_FENCE_FLAG_SHARED
        } else {
            D3D12_FENCE_FLAG_NONE
        };
        let fence: ID3D12Fence = unsafe { self.device.device().CreateFence(initial, flags) }
            .map_err(creation(InteropStep::DeviceCreation, "CreateFence"))?;
        let id = FenceId::from_raw(self.next_id());
        self.fences.insert(id, Fence { fence, shared });
        Ok(id)
    }

    fn export_fence(&mut self, fence: FenceId) -> Result<SharedHandle> {
        let entry = self.fences.get(&fence).ok_or_else(|| {
            InteropError::resource(InteropStep::HandleExport, format!("unknown fence {fence}"))
        })?;
        if !entry.shared {
            return Err(InteropError::capability(
                InteropStep::HandleExport,
                format!("{fence} was not created shareable"),
            ));
        }
        let handle = unsafe {
            self.device
                .device()
                .CreateSharedHandle(&entry.fence, None, GENERIC_ALL.0, PCWSTR::null())
        }
        .map_err(creation(InteropStep::HandleExport, "CreateSharedHandle(fence)"))?;
        let handle = to_shared(handle);
        self.shared.push(handle);
        Ok(handle)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn create_command_context(&mut self) -> Result<ContextId> {
        let device = self.device.device();
        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .map_err(creation(InteropStep::CommandRecording, "CreateCommandAllocator"))?;
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                &allocator,
                None::<&ID3D12PipelineState>,
            )
        }
        .map_err(creation(InteropStep::CommandRecording, "CreateCommandList"))?;
        // Lists are created open; contexts start closed.
        unsafe { list.Close() }
            .map_err(submission(InteropStep::CommandRecording, "ID3D12GraphicsCommandList::Close"))?;

        let id = ContextId::from_raw(self.next_id());
        self.contexts.insert(
            id,
            Context {
                allocator,
                list,
                recording: false,
                retired_at: 0,
            },
        );
        Ok(id)
    }

    fn reset_context(&mut self, context: ContextId) -> Result<()> {
        let completed = self.submissions.completed();
        let ctx = self.context(context)?;
        if completed < ctx.retired_at {
            return Err(InteropError::submission(
                InteropStep::CommandRecording,
                format!("{context} reset while its previous commands are still executing"),
            ));
        }
        unsafe {
            ctx.allocator
                .Reset()
                .map_err(submission(InteropStep::CommandRecording, "ID3D12CommandAllocator::Reset"))?;
            ctx.list
                .Reset(&ctx.allocator, None::<&ID3D12PipelineState>)
                .map_err(submission(InteropStep::CommandRecording, "ID3D12GraphicsCommandList::Reset"))?;
        }
        ctx.recording = true;
        Ok(())
    }

    fn record(&mut self, context: ContextId, command: &Command) -> Result<()> {
        let step = InteropStep::CommandRecording;
        let (first, second) = match *command {
            Command::Transition { texture, .. } => (self.texture(texture, step)?.resource.clone(), None),
            Command::Copy { src, dst } => (
                self.texture(src, step)?.resource.clone(),
                Some(self.texture(dst, step)?.resource.clone()),
            ),
        };
        let ctx = self.context(context)?;
        if !ctx.recording {
            return Err(InteropError::submission(step, format!("{context} is closed")));
        }
        unsafe {
            match (*command, second) {
                (Command::Transition { before, after, .. }, _) => ctx.list.ResourceBarrier(&[
                    transition(&first, resource_state(before), resource_state(after)),
                ]),
                (Command::Copy { .. }, Some(dst)) => ctx.list.CopyResource(&dst, &first),
                (Command::Copy { .. }, None) => {}
            }
        }
        Ok(())
    }

    fn close_context(&mut self, context: ContextId) -> Result<()> {
        let ctx = self.context(context)?;
        if !ctx.recording {
            return Err(InteropError::submission(
                InteropStep::CommandRecording,
                format!("{context} closed twice"),
            ));
        }
        unsafe { ctx.list.Close() }
            .map_err(submission(InteropStep::CommandRecording, "ID3D12GraphicsCommandList::Close"))?;
        ctx.recording = false;
        Ok(())
    }

    fn execute(&mut self, context: ContextId) -> Result<()> {
        let list = {
            let ctx = self.context(context)?;
            if ctx.recording {
                return Err(InteropError::submission(
                    InteropStep::Submission,
                    format!("{context} executed while still recording"),
                ));
            }
            command_list(&ctx.list)?
        };
        unsafe { self.device.queue().ExecuteCommandLists(&[Some(list)]) };
        let retired_at = self.submissions.signal(self.device.queue())?;
        self.context(context)?.retired_at = retired_at;
        Ok(())
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let fence = &self.fence(fence)?.fence;
        unsafe { self.device.queue().Signal(fence, value) }
            .map_err(submission(InteropStep::Submission, "ID3D12CommandQueue::Signal"))
    }

    fn queue_wait(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let fence = &self.fence(fence)?.fence;
        unsafe { self.device.queue().Wait(fence, value) }
            .map_err(submission(InteropStep::Submission, "ID3D12CommandQueue::Wait"))
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        Ok(unsafe { self.fence(fence)?.fence.GetCompletedValue() })
    }

    fn wait_for(&mut self, fence: FenceId, value: u64) -> Result<()> {
        wait_on(&self.fence(fence)?.fence, self.submissions.event(), value)
    }

    fn create_swap_chain(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        buffer_count: u32,
    ) -> Result<()> {
        if buffer_count == 0 {
            return Err(InteropError::resource(
                InteropStep::Present,
                "a swap chain needs at least one buffer",
            ));
        }
        if self.hwnd.is_some() {
            check_flip_swap_chain(format, buffer_count)?;
        }
        if let Some(old) = self.swap_chain.take() {
            self.submissions.drain(self.device.queue())?;
            for &buffer in old.buffers() {
                self.destroy_texture(buffer);
            }
        }
        let desc = TextureDesc::new(width, height, format).with_usage(UsageFlags::RENDER_TARGET);
        let chain = match self.hwnd {
            Some(hwnd) => self.window_chain(hwnd, &desc, buffer_count)?,
            None => self.offscreen_chain(&desc, buffer_count)?,
        };
        debug!(
            "D3D12 swap chain {width}x{height} {format:?} with {buffer_count} buffers ({})",
            if self.hwnd.is_some() { "window" } else { "offscreen" }
        );
        self.swap_chain = Some(chain);
        Ok(())
    }

    fn back_buffer(&self, index: u32) -> Result<TextureId> {
        self.swap_chain
            .as_ref()
            .and_then(|chain| chain.buffers().get(index as usize).copied())
            .ok_or_else(|| {
                InteropError::submission(InteropStep::Present, format!("no back buffer {index}"))
            })
    }

    fn current_back_buffer_index(&self) -> u32 {
        match &self.swap_chain {
            Some(SwapChain::Window { chain, .. }) => unsafe { chain.GetCurrentBackBufferIndex() },
            Some(SwapChain::Offscreen { current, .. }) => *current,
            None => 0,
        }
    }

    fn present(&mut self) -> Result<()> {
        match &mut self.swap_chain {
            Some(SwapChain::Window { chain, .. }) => unsafe { chain.Present(1, DXGI_PRESENT(0)) }
                .ok()
                .map_err(submission(InteropStep::Present, "IDXGISwapChain::Present")),
            Some(SwapChain::Offscreen { buffers, current }) => {
                *current = (*current + 1) % buffers.len() as u32;
                Ok(())
            }
            None => Err(InteropError::submission(
                InteropStep::Present,
                "present without a swap chain",
            )),
        }
    }

    fn read_texture(&mut self, texture: TextureId, state: ResourceState) -> Result<Vec<u8>> {
        self.submissions.drain(self.device.queue())?;
        let (resource, desc) = {
            let entry = self.texture(texture, InteropStep::Readback)?;
            (entry.resource.clone(), entry.desc)
        };
        let (layout, rows, total) = self.footprint(&unsafe { resource.GetDesc() });
        let readback = self.buffer(total, D3D12_HEAP_TYPE_READBACK, D3D12_RESOURCE_STATE_COPY_DEST)?;

        let before = resource_state(state);
        let src = subresource_location(&resource);
        let dst = footprint_location(&readback, layout);
        self.transfer(|list| unsafe {
            if before != D3D12_RESOURCE_STATE_COPY_SOURCE {
                list.ResourceBarrier(&[transition(&resource, before, D3D12_RESOURCE_STATE_COPY_SOURCE)]);
            }
            list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
            if before != D3D12_RESOURCE_STATE_COPY_SOURCE {
                list.ResourceBarrier(&[transition(&resource, D3D12_RESOURCE_STATE_COPY_SOURCE, before)]);
            }
        })?;

        let row_bytes = desc.row_pitch();
        let mut bytes = vec![0u8; desc.byte_len()];
        let mut mapped: *mut c_void = std::ptr::null_mut();
        unsafe { readback.Map(0, None, Some(&mut mapped as *mut _)) }
            .map_err(submission(InteropStep::Readback, "Map(readback)"))?;
        for row in 0..rows as usize {
            unsafe {
                let src = (mapped as *const u8)
                    .add(layout.Offset as usize + row * layout.Footprint.RowPitch as usize);
                std::ptr::copy_nonoverlapping(
                    src,
                    bytes[row * row_bytes..].as_mut_ptr(),
                    row_bytes,
                );
            }
        }
        unsafe { readback.Unmap(0, None) };
        Ok(bytes)
    }
}

impl Drop for D3d12PresentDevice {
    fn drop(&mut self) {
        if let Err(e) = self.submissions.drain(self.device.queue()) {
            warn!("Failed to drain the D3D12 queue on shutdown: {e}");
        }
        for handle in self.shared.drain(..) {
            unsafe {
                let _ = CloseHandle(super::from_shared(handle));
            }
        }
        self.swap_chain = None;
        self.contexts.clear();
        self.textures.clear();
        self.fences.clear();
    }
}

// ---------------------------------------------------------------------------
// Barrier and copy-location helpers
// ---------------------------------------------------------------------------

// The descriptors borrow `resource` without an extra reference; they must not
// outlive it.

fn transition(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { std::mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn subresource_location(resource: &ID3D12Resource) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            SubresourceIndex: 0,
        },
    }
}

fn footprint_location(
    buffer: &ID3D12Resource,
    layout: D3D12_PLACED_SUBRESOURCE_FOOTPRINT,
) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(buffer) },
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: layout,
        },
    }
}
