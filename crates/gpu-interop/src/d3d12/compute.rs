use std::collections::HashMap;
use std::sync::Arc;

use windows::core::{Interface, IUnknown, PCSTR};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_OPTIMIZATION_LEVEL3};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Direct3D11on12::*;
use windows::Win32::Graphics::Direct3D12::ID3D12Resource;

use tracing::{debug, warn};

use interop_core::{InteropError, InteropStep, Kernel, Result, TextureDesc, UsageFlags};

use super::present::D3d12PresentDevice;
use super::{creation, dxgi_format, from_shared, resource_state, returned_null, submission};
use crate::runtime::{
    ComputeRuntime, DeviceAttachment, FenceId, ResourceState, SharedAccess, SharedHandle,
    SharedHandleExport, ViewId,
};

struct View {
    resource: ID3D11Resource,
    srv: Option<ID3D11ShaderResourceView>,
    uav: Option<ID3D11UnorderedAccessView>,
    desc: TextureDesc,
    /// Wrapped through D3D11On12; needs acquire/release.
    wrapped: bool,
    acquired: bool,
}

/// Runtime B on D3D11.
pub struct D3d11ComputeDevice {
    attachment: DeviceAttachment,
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    on12: Option<ID3D11On12Device>,
    sampler: ID3D11SamplerState,
    shaders: HashMap<String, ID3D11ComputeShader>,
    views: HashMap<ViewId, View>,
    fences: HashMap<FenceId, ID3D11Fence>,
    next_id: u64,
}

impl D3d11ComputeDevice {
    /// Layer a D3D11 device on `present`'s D3D12 device and queue.
    pub fn layered(present: &D3d12PresentDevice) -> Result<Self> {
        let d3d12 = present.device();
        let queue: IUnknown = d3d12
            .queue()
            .cast()
            .map_err(creation(InteropStep::DeviceWrap, "cast queue to IUnknown"))?;

        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11On12CreateDevice(
                d3d12.device(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT.0 as u32,
                None,
                Some(&[Some(queue)]),
                0,
                Some(&mut device as *mut _),
                Some(&mut context as *mut _),
                None,
            )
        }
        .map_err(creation(InteropStep::DeviceWrap, "D3D11On12CreateDevice"))?;
        let device: ID3D11Device =
            device.ok_or_else(returned_null(InteropStep::DeviceWrap, "D3D11On12CreateDevice"))?;
        let context = context
            .ok_or_else(returned_null(InteropStep::DeviceWrap, "D3D11On12CreateDevice(context)"))?;
        let on12: ID3D11On12Device = device
            .cast()
            .map_err(creation(InteropStep::DeviceWrap, "cast to ID3D11On12Device"))?;

        debug!("D3D11 device layered on '{}'", d3d12.info().name);
        Self::with_device(DeviceAttachment::Layered, device, context, Some(on12))
    }

    /// Create an independent D3D11 device on the adapter `present` runs on.
    pub fn native(present: &D3d12PresentDevice) -> Result<Self> {
        let adapter = present.device().adapter();
        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&[D3D_FEATURE_LEVEL_11_0]),
                D3D11_SDK_VERSION,
                Some(&mut device as *mut _),
                None,
                Some(&mut context as *mut _),
            )
        }
        .map_err(creation(InteropStep::DeviceCreation, "D3D11CreateDevice"))?;
        let device: ID3D11Device =
            device.ok_or_else(returned_null(InteropStep::DeviceCreation, "D3D11CreateDevice"))?;
        let context = context
            .ok_or_else(returned_null(InteropStep::DeviceCreation, "D3D11CreateDevice(context)"))?;

        debug!("Native D3D11 device on '{}'", present.device().info().name);
        Self::with_device(DeviceAttachment::Native, device, context, None)
    }

    fn with_device(
        attachment: DeviceAttachment,
        device: ID3D11Device,
        context: ID3D11DeviceContext,
        on12: Option<ID3D11On12Device>,
    ) -> Result<Self> {
        let sampler = linear_clamp_sampler(&device)?;
        Ok(Self {
            attachment,
            device,
            context,
            on12,
            sampler,
            shaders: HashMap::new(),
            views: HashMap::new(),
            fences: HashMap::new(),
            next_id: 0,
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Build the views `usage` asks for and register them.
    fn insert_view(
        &mut self,
        resource: ID3D11Resource,
        desc: TextureDesc,
        usage: UsageFlags,
        wrapped: bool,
        step: InteropStep,
    ) -> Result<ViewId> {
        let mut srv = None;
        if usage.contains(UsageFlags::SHADER_READ) {
            unsafe {
                self.device
                    .CreateShaderResourceView(&resource, None, Some(&mut srv as *mut _))
            }
            .map_err(creation(step, "CreateShaderResourceView"))?;
        }
        let mut uav = None;
        if usage.contains(UsageFlags::UNORDERED_WRITE) {
            unsafe {
                self.device
                    .CreateUnorderedAccessView(&resource, None, Some(&mut uav as *mut _))
            }
            .map_err(creation(step, "CreateUnorderedAccessView"))?;
        }
        let id = ViewId::from_raw(self.next_id());
        self.views.insert(
            id,
            View {
                resource,
                srv,
                uav,
                desc,
                wrapped,
                acquired: false,
            },
        );
        Ok(id)
    }

    fn wrapped_resources(&self, views: &[ViewId], acquired: bool) -> Result<Vec<Option<ID3D11Resource>>> {
        let mut resources = Vec::with_capacity(views.len());
        for view in views {
            let bound = self
                .views
                .get(view)
                .ok_or_else(|| InteropError::misuse(format!("unknown view {view}")))?;
            if !bound.wrapped {
                return Err(InteropError::misuse(format!(
                    "{view} was imported from a shared handle and has no acquire/release"
                )));
            }
            if bound.acquired != acquired {
                return Err(InteropError::misuse(if acquired {
                    format!("release of {view} without a matching acquire")
                } else {
                    format!("{view} acquired twice")
                }));
            }
            resources.push(Some(bound.resource.clone()));
        }
        Ok(resources)
    }

    fn set_acquired(&mut self, views: &[ViewId], acquired: bool) {
        for view in views {
            if let Some(bound) = self.views.get_mut(view) {
                bound.acquired = acquired;
            }
        }
    }

    fn shader(&mut self, kernel: &dyn Kernel) -> Result<ID3D11ComputeShader> {
        if let Some(shader) = self.shaders.get(kernel.name()) {
            return Ok(shader.clone());
        }
        let source = kernel.hlsl().ok_or_else(|| {
            InteropError::capability(
                InteropStep::ShaderCompilation,
                format!("kernel '{}' has no HLSL representation", kernel.name()),
            )
        })?;
        let bytecode = compile_cs(kernel.name(), source)?;
        let mut shader = None;
        unsafe {
            self.device
                .CreateComputeShader(&bytecode, None, Some(&mut shader as *mut _))
        }
        .map_err(creation(InteropStep::ShaderCompilation, "CreateComputeShader"))?;
        let shader: ID3D11ComputeShader =
            shader.ok_or_else(returned_null(InteropStep::ShaderCompilation, "CreateComputeShader"))?;
        debug!("Compiled kernel '{}' ({} bytes)", kernel.name(), bytecode.len());
        self.shaders.insert(kernel.name().to_owned(), shader.clone());
        Ok(shader)
    }

    fn fence(&self, fence: FenceId) -> Result<&ID3D11Fence> {
        self.fences.get(&fence).ok_or_else(|| {
            InteropError::submission(InteropStep::FenceWait, format!("unknown fence {fence}"))
        })
    }

    fn context4(&self) -> Result<ID3D11DeviceContext4> {
        self.context
            .cast()
            .map_err(submission(InteropStep::Submission, "cast to ID3D11DeviceContext4"))
    }
}

impl ComputeRuntime for D3d11ComputeDevice {
    type Present = D3d12PresentDevice;

    fn attachment(&self) -> DeviceAttachment {
        self.attachment
    }

    fn wrap(
        &mut self,
        resource: &ID3D12Resource,
        desc: &TextureDesc,
        usage: UsageFlags,
        in_state: ResourceState,
        out_state: ResourceState,
    ) -> Result<ViewId> {
        let on12 = self.on12.clone().ok_or_else(|| {
            InteropError::capability(
                InteropStep::DeviceWrap,
                "a native compute device cannot wrap presentation resources",
            )
        })?;
        let mut bind = 0;
        if usage.contains(UsageFlags::SHADER_READ) {
            bind |= D3D11_BIND_SHADER_RESOURCE.0 as u32;
        }
        if usage.contains(UsageFlags::UNORDERED_WRITE) {
            bind |= D3D11_BIND_UNORDERED_ACCESS.0 as u32;
        }
        let flags = D3D11_RESOURCE_FLAGS {
            BindFlags: bind,
            ..Default::default()
        };
        let wrapped: ID3D11Resource = unsafe {
            on12.CreateWrappedResource(
                resource,
                &flags,
                resource_state(in_state),
                resource_state(out_state),
            )
        }
        .map_err(creation(InteropStep::DeviceWrap, "CreateWrappedResource"))?;
        self.insert_view(wrapped, *desc, usage, true, InteropStep::DeviceWrap)
    }

    fn open_shared(&mut self, export: &SharedHandleExport, usage: UsageFlags) -> Result<ViewId> {
        let step = InteropStep::HandleImport;
        if usage.contains(UsageFlags::UNORDERED_WRITE) && !export.access.contains(SharedAccess::WRITE)
        {
            return Err(InteropError::resource(
                step,
                "shared handle was exported without write access",
            ));
        }
        let device1: ID3D11Device1 = self
            .device
            .cast()
            .map_err(creation(step, "cast to ID3D11Device1"))?;
        let texture: ID3D11Texture2D = unsafe { device1.OpenSharedResource1(from_shared(export.handle)) }
            .map_err(creation(step, "OpenSharedResource1"))?;

        let mut actual = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut actual) };
        let expected = &export.desc;
        if actual.Width != expected.width
            || actual.Height != expected.height
            || actual.Format != dxgi_format(expected.format)
            || actual.MipLevels != expected.mip_levels
        {
            return Err(InteropError::resource(
                step,
                format!(
                    "shared texture is {}x{} format {} with {} mip(s), expected {}x{} {:?} with {}",
                    actual.Width,
                    actual.Height,
                    actual.Format.0,
                    actual.MipLevels,
                    expected.width,
                    expected.height,
                    expected.format,
                    expected.mip_levels
                ),
            ));
        }

        let resource: ID3D11Resource = texture
            .cast()
            .map_err(creation(step, "cast to ID3D11Resource"))?;
        debug!("Opened shared handle {:#x}", export.handle.0);
        self.insert_view(resource, export.desc, usage, false, step)
    }

    fn release_view(&mut self, view: ViewId) {
        if let Some(bound) = self.views.remove(&view) {
            if bound.acquired {
                warn!("Releasing {view} while still acquired");
                if let Some(on12) = &self.on12 {
                    unsafe { on12.ReleaseWrappedResources(&[Some(bound.resource.clone())]) };
                }
            }
        }
        // Wrapped resources are destroyed on flush.
        unsafe { self.context.Flush() };
    }

    fn acquire(&mut self, views: &[ViewId]) -> Result<()> {
        let resources = self.wrapped_resources(views, false)?;
        let on12 = self
            .on12
            .as_ref()
            .ok_or_else(|| InteropError::misuse("acquire on a native compute device"))?;
        unsafe { on12.AcquireWrappedResources(&resources) };
        self.set_acquired(views, true);
        Ok(())
    }

    fn release(&mut self, views: &[ViewId]) -> Result<()> {
        let resources = self.wrapped_resources(views, true)?;
        let on12 = self
            .on12
            .as_ref()
            .ok_or_else(|| InteropError::misuse("release on a native compute device"))?;
        unsafe { on12.ReleaseWrappedResources(&resources) };
        self.set_acquired(views, false);
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: &Arc<dyn Kernel>,
        source: ViewId,
        result: ViewId,
    ) -> Result<()> {
        let shader = self.shader(kernel.as_ref())?;
        let step = InteropStep::CommandRecording;
        let src = self
            .views
            .get(&source)
            .ok_or_else(|| InteropError::submission(step, format!("unknown view {source}")))?;
        let dst = self
            .views
            .get(&result)
            .ok_or_else(|| InteropError::submission(step, format!("unknown view {result}")))?;
        for view in [src, dst] {
            if view.wrapped && !view.acquired {
                warn!("Dispatching over a wrapped view that was not acquired");
            }
        }
        let srv = src
            .srv
            .clone()
            .ok_or_else(|| InteropError::submission(step, format!("{source} is not shader-readable")))?;
        let uav = dst
            .uav
            .clone()
            .ok_or_else(|| InteropError::submission(step, format!("{result} is not unordered-writable")))?;

        let (group_x, group_y) = kernel.group_size();
        let groups_x = dst.desc.width.div_ceil(group_x);
        let groups_y = dst.desc.height.div_ceil(group_y);

        let ctx = &self.context;
        unsafe {
            ctx.CSSetShader(&shader, None);
            ctx.CSSetShaderResources(0, Some(&[Some(srv)]));
            ctx.CSSetUnorderedAccessViews(0, 1, Some(&Some(uav) as *const _), None);
            ctx.CSSetSamplers(0, Some(&[Some(self.sampler.clone())]));
            ctx.Dispatch(groups_x, groups_y, 1);

            // Unbind so the textures can be released to the other runtime.
            ctx.CSSetShaderResources(0, Some(&[None]));
            ctx.CSSetUnorderedAccessViews(0, 1, Some(&None as *const _), None);
            ctx.CSSetShader(None, None);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        unsafe { self.context.Flush() };
        Ok(())
    }

    fn open_fence(&mut self, handle: SharedHandle) -> Result<FenceId> {
        let device5: ID3D11Device5 = self
            .device
            .cast()
            .map_err(creation(InteropStep::HandleImport, "cast to ID3D11Device5"))?;
        let fence: ID3D11Fence = unsafe { device5.OpenSharedFence(from_shared(handle)) }
            .map_err(creation(InteropStep::HandleImport, "OpenSharedFence"))?;
        let id = FenceId::from_raw(self.next_id());
        self.fences.insert(id, fence);
        Ok(id)
    }

    fn close_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let context4 = self.context4()?;
        unsafe { context4.Signal(self.fence(fence)?, value) }
            .map_err(submission(InteropStep::Submission, "ID3D11DeviceContext4::Signal"))
    }

    fn queue_wait(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let context4 = self.context4()?;
        unsafe { context4.Wait(self.fence(fence)?, value) }
            .map_err(submission(InteropStep::Submission, "ID3D11DeviceContext4::Wait"))
    }
}

impl Drop for D3d11ComputeDevice {
    fn drop(&mut self) {
        if self.views.values().any(|view| view.acquired) {
            warn!("D3D11 compute device dropped with acquired views");
        }
        self.views.clear();
        unsafe {
            self.context.ClearState();
            self.context.Flush();
        }
    }
}

// ---------------------------------------------------------------------------
// Shader and sampler helpers
// ---------------------------------------------------------------------------

fn compile_cs(name: &str, source: &str) -> Result<Vec<u8>> {
    let mut code = None;
    let mut errors = None;
    let compiled = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            PCSTR::null(),
            None,
            None,
            windows::core::s!("main"),
            windows::core::s!("cs_5_0"),
            D3DCOMPILE_OPTIMIZATION_LEVEL3,
            0,
            &mut code,
            Some(&mut errors as *mut _),
        )
    };
    if let Err(e) = compiled {
        let log = errors
            .map(|blob: ID3DBlob| String::from_utf8_lossy(blob_bytes(&blob)).into_owned())
            .unwrap_or_default();
        return Err(InteropError::capability(
            InteropStep::ShaderCompilation,
            format!("D3DCompile({name}): {e}: {}", log.trim_end()),
        ));
    }
    let code: ID3DBlob =
        code.ok_or_else(returned_null(InteropStep::ShaderCompilation, "D3DCompile"))?;
    Ok(blob_bytes(&code).to_vec())
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    }
}

fn linear_clamp_sampler(device: &ID3D11Device) -> Result<ID3D11SamplerState> {
    let desc = D3D11_SAMPLER_DESC {
        Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
        AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
        AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
        MaxAnisotropy: 1,
        ComparisonFunc: D3D11_COMPARISON_NEVER,
        MinLOD: 0.0,
        MaxLOD: f32::MAX,
        ..Default::default()
    };
    let mut sampler = None;
    unsafe { device.CreateSamplerState(&desc, Some(&mut sampler as *mut _)) }
        .map_err(creation(InteropStep::ShaderCompilation, "CreateSamplerState"))?;
    sampler.ok_or_else(returned_null(InteropStep::ShaderCompilation, "CreateSamplerState"))
}
