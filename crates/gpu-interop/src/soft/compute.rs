use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use interop_core::{InteropError, InteropStep, Kernel, Result, TextureDesc, UsageFlags};
use tracing::{debug, warn};

use super::adapter::{QueueId, SharedObject, SoftAdapter, Work};
use super::memory::{Binding, WrappedView};
use super::present::{SoftPresentDevice, SoftResource};
use crate::runtime::{
    ComputeRuntime, DeviceAttachment, FenceId, ResourceState, SharedAccess, SharedHandle,
    SharedHandleExport, ViewId,
};

struct SoftView {
    binding: Binding,
    usage: UsageFlags,
    acquired: bool,
}

/// Runtime B on the software adapter.
///
/// A layered device records into the presentation device's queue and reaches
/// its textures by wrapping. A native device has a queue of its own and can
/// only import shared handles.
pub struct SoftComputeDevice {
    adapter: SoftAdapter,
    attachment: DeviceAttachment,
    /// Presentation device a layered device was created on.
    parent: Option<u64>,
    queue: QueueId,
    views: HashMap<ViewId, SoftView>,
    fences: HashMap<FenceId, u64>,
    recorded: Vec<Work>,
}

impl SoftComputeDevice {
    /// Layer a compute device on `present`'s device and queue.
    pub fn layered(present: &SoftPresentDevice) -> Self {
        debug!("Soft compute device layered on presentation device {}", present.device_id());
        Self::with_queue(
            present.soft_adapter(),
            DeviceAttachment::Layered,
            Some(present.device_id()),
            present.queue(),
        )
    }

    /// Create an independent compute device with its own queue.
    pub fn native(adapter: &SoftAdapter) -> Self {
        debug!("Native soft compute device on '{}'", adapter.info().name);
        Self::with_queue(adapter, DeviceAttachment::Native, None, adapter.create_queue())
    }

    fn with_queue(
        adapter: &SoftAdapter,
        attachment: DeviceAttachment,
        parent: Option<u64>,
        queue: QueueId,
    ) -> Self {
        Self {
            adapter: adapter.clone(),
            attachment,
            parent,
            queue,
            views: HashMap::new(),
            fences: HashMap::new(),
            recorded: Vec::new(),
        }
    }

    /// Views currently acquired from the presentation runtime.
    pub fn acquired_views(&self) -> usize {
        self.views.values().filter(|view| view.acquired).count()
    }

    fn insert_view(&mut self, binding: Binding, usage: UsageFlags) -> ViewId {
        let id = ViewId::from_raw(self.adapter.next_id());
        self.views.insert(
            id,
            SoftView {
                binding,
                usage,
                acquired: false,
            },
        );
        id
    }

    fn wrapped(&self, view: ViewId) -> Result<Arc<WrappedView>> {
        match self.views.get(&view).map(|v| &v.binding) {
            Some(Binding::Wrapped(wrapped)) => Ok(wrapped.clone()),
            Some(Binding::Direct { .. }) => Err(InteropError::misuse(format!(
                "{view} was imported from a shared handle and has no acquire/release"
            ))),
            None => Err(InteropError::misuse(format!("unknown view {view}"))),
        }
    }

    fn bound(&self, view: ViewId, usage: UsageFlags) -> Result<&SoftView> {
        let bound = self.views.get(&view).ok_or_else(|| {
            InteropError::submission(InteropStep::CommandRecording, format!("unknown view {view}"))
        })?;
        if !bound.usage.contains(usage) {
            return Err(InteropError::submission(
                InteropStep::CommandRecording,
                format!("{view} is not bound for {usage:?}"),
            ));
        }
        Ok(bound)
    }

    fn fence(&self, fence: FenceId) -> Result<u64> {
        self.fences.get(&fence).copied().ok_or_else(|| {
            InteropError::submission(InteropStep::FenceWait, format!("unknown fence {fence}"))
        })
    }
}

impl ComputeRuntime for SoftComputeDevice {
    type Present = SoftPresentDevice;

    fn attachment(&self) -> DeviceAttachment {
        self.attachment
    }

    fn wrap(
        &mut self,
        resource: &SoftResource,
        desc: &TextureDesc,
        usage: UsageFlags,
        in_state: ResourceState,
        out_state: ResourceState,
    ) -> Result<ViewId> {
        if self.attachment != DeviceAttachment::Layered {
            return Err(InteropError::capability(
                InteropStep::DeviceWrap,
                "a native compute device cannot wrap presentation resources",
            ));
        }
        if self.parent != Some(resource.device) {
            return Err(InteropError::capability(
                InteropStep::DeviceWrap,
                "resource belongs to a device this compute device is not layered on",
            ));
        }
        let block = resource.block.upgrade().ok_or_else(|| {
            InteropError::resource(InteropStep::DeviceWrap, "resource was already destroyed")
        })?;
        if !block.desc.same_layout(desc) {
            return Err(InteropError::resource(
                InteropStep::DeviceWrap,
                format!(
                    "wrap requested {}x{} {:?}, resource is {}x{} {:?}",
                    desc.width,
                    desc.height,
                    desc.format,
                    block.desc.width,
                    block.desc.height,
                    block.desc.format
                ),
            ));
        }
        let view = WrappedView {
            block: resource.block.clone(),
            desc: *desc,
            in_state,
            out_state,
            cache: Mutex::new(block.snapshot()),
        };
        Ok(self.insert_view(Binding::Wrapped(Arc::new(view)), usage))
    }

    fn open_shared(&mut self, export: &SharedHandleExport, usage: UsageFlags) -> Result<ViewId> {
        let Some(SharedObject::Texture {
            block,
            desc,
            access,
        }) = self.adapter.shared_object(export.handle)
        else {
            return Err(InteropError::resource(
                InteropStep::HandleImport,
                format!("{:#x} is not a shared texture handle", export.handle.0),
            ));
        };
        if desc != export.desc {
            return Err(InteropError::resource(
                InteropStep::HandleImport,
                format!(
                    "shared texture is {}x{} {:?} with {} mip(s), import requested {}x{} {:?} with {}",
                    desc.width,
                    desc.height,
                    desc.format,
                    desc.mip_levels,
                    export.desc.width,
                    export.desc.height,
                    export.desc.format,
                    export.desc.mip_levels
                ),
            ));
        }
        let needed = if usage.contains(UsageFlags::UNORDERED_WRITE) {
            SharedAccess::ALL
        } else {
            SharedAccess::READ
        };
        if !access.contains(needed) {
            return Err(InteropError::resource(
                InteropStep::HandleImport,
                format!("handle grants {access:?}, the view needs {needed:?}"),
            ));
        }
        Ok(self.insert_view(Binding::Direct { block, desc }, usage))
    }

    fn release_view(&mut self, view: ViewId) {
        if let Some(released) = self.views.remove(&view) {
            if released.acquired {
                warn!("{view} released while still acquired");
            }
        }
    }

    fn acquire(&mut self, views: &[ViewId]) -> Result<()> {
        let mut wrapped = Vec::with_capacity(views.len());
        for &view in views {
            let target = self.wrapped(view)?;
            if self.views[&view].acquired {
                return Err(InteropError::misuse(format!(
                    "{view} acquired twice without a release"
                )));
            }
            wrapped.push(target);
        }
        for &view in views {
            if let Some(v) = self.views.get_mut(&view) {
                v.acquired = true;
            }
        }
        self.recorded.extend(wrapped.into_iter().map(Work::Acquire));
        Ok(())
    }

    fn release(&mut self, views: &[ViewId]) -> Result<()> {
        let mut wrapped = Vec::with_capacity(views.len());
        for &view in views {
            let target = self.wrapped(view)?;
            if !self.views[&view].acquired {
                return Err(InteropError::misuse(format!(
                    "{view} released without a matching acquire"
                )));
            }
            wrapped.push(target);
        }
        for &view in views {
            if let Some(v) = self.views.get_mut(&view) {
                v.acquired = false;
            }
        }
        self.recorded.extend(wrapped.into_iter().map(Work::Release));
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: &Arc<dyn Kernel>,
        source: ViewId,
        result: ViewId,
    ) -> Result<()> {
        let src = self.bound(source, UsageFlags::SHADER_READ)?;
        let dst = self.bound(result, UsageFlags::UNORDERED_WRITE)?;
        for (id, view) in [(source, src), (result, dst)] {
            if matches!(view.binding, Binding::Wrapped(_)) && !view.acquired {
                warn!("Dispatching {} on {id} without acquiring it first", kernel.name());
            }
        }
        let work = Work::Dispatch {
            kernel: kernel.clone(),
            source: src.binding.clone(),
            result: dst.binding.clone(),
        };
        self.recorded.push(work);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.recorded.is_empty() {
            self.adapter.submit(self.queue, self.recorded.drain(..));
        }
        Ok(())
    }

    fn open_fence(&mut self, handle: SharedHandle) -> Result<FenceId> {
        let Some(SharedObject::Fence(raw)) = self.adapter.shared_object(handle) else {
            return Err(InteropError::resource(
                InteropStep::HandleImport,
                format!("{:#x} is not a shared fence handle", handle.0),
            ));
        };
        if !self.adapter.retain_fence(raw) {
            return Err(InteropError::resource(
                InteropStep::HandleImport,
                "shared fence was already destroyed",
            ));
        }
        let fence = FenceId::from_raw(self.adapter.next_id());
        self.fences.insert(fence, raw);
        Ok(fence)
    }

    fn close_fence(&mut self, fence: FenceId) {
        if let Some(raw) = self.fences.remove(&fence) {
            self.adapter.release_fence(raw);
        }
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let fence = self.fence(fence)?;
        self.recorded.push(Work::Signal { fence, value });
        Ok(())
    }

    fn queue_wait(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let fence = self.fence(fence)?;
        self.recorded.push(Work::Wait { fence, value });
        Ok(())
    }
}

impl Drop for SoftComputeDevice {
    fn drop(&mut self) {
        if !self.recorded.is_empty() {
            warn!(
                "Dropping {} recorded compute work item(s) that were never flushed",
                self.recorded.len()
            );
        }
        for raw in self.fences.values() {
            self.adapter.release_fence(*raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Command, PresentRuntime, TextureId};
    use crate::soft::SoftAdapterConfig;
    use interop_core::{GrayscaleKernel, SharingMode, TextureFormat};
    use pretty_assertions::assert_eq;

    fn desc(usage: UsageFlags) -> TextureDesc {
        TextureDesc::new(2, 2, TextureFormat::Rgba8Unorm)
            .with_usage(usage)
            .with_sharing(SharingMode::Aliased)
    }

    struct Layered {
        present: SoftPresentDevice,
        compute: SoftComputeDevice,
        source: ViewId,
        result: ViewId,
        source_texture: TextureId,
        result_texture: TextureId,
        fence: FenceId,
    }

    fn layered(texels: &[u8]) -> Layered {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let mut present = SoftPresentDevice::new(&adapter);
        let mut compute = SoftComputeDevice::layered(&present);
        let src_desc = desc(UsageFlags::SHADER_READ);
        let dst_desc = desc(UsageFlags::UNORDERED_WRITE);
        let src = present
            .create_texture(&src_desc, Some(texels), ResourceState::NonPixelShaderResource)
            .unwrap();
        let dst = present
            .create_texture(&dst_desc, None, ResourceState::CopySource)
            .unwrap();
        let source = compute
            .wrap(
                &present.resource(src).unwrap(),
                &src_desc,
                UsageFlags::SHADER_READ,
                ResourceState::NonPixelShaderResource,
                ResourceState::NonPixelShaderResource,
            )
            .unwrap();
        let result = compute
            .wrap(
                &present.resource(dst).unwrap(),
                &dst_desc,
                UsageFlags::UNORDERED_WRITE,
                ResourceState::CopySource,
                ResourceState::CopySource,
            )
            .unwrap();
        let fence = present.create_fence(0, false).unwrap();
        Layered {
            present,
            compute,
            source,
            result,
            source_texture: src,
            result_texture: dst,
            fence,
        }
    }

    fn kernel() -> Arc<dyn Kernel> {
        Arc::new(GrayscaleKernel)
    }

    #[test]
    fn release_publishes_the_dispatch() {
        let mut t = layered(&[255, 0, 0, 255].repeat(4));
        t.compute.acquire(&[t.source, t.result]).unwrap();
        t.compute.dispatch(&kernel(), t.source, t.result).unwrap();
        t.compute.release(&[t.source, t.result]).unwrap();
        t.compute.flush().unwrap();
        let bytes = t
            .present
            .read_texture(t.result_texture, ResourceState::CopySource)
            .unwrap();
        assert_eq!(bytes, [76, 76, 76, 255].repeat(4));
    }

    #[test]
    fn missing_release_leaves_presentation_memory_stale() {
        let mut t = layered(&[255, 0, 0, 255].repeat(4));
        t.compute.acquire(&[t.source, t.result]).unwrap();
        t.compute.dispatch(&kernel(), t.source, t.result).unwrap();
        t.compute.flush().unwrap();
        let bytes = t
            .present
            .read_texture(t.result_texture, ResourceState::CopySource)
            .unwrap();
        assert_eq!(bytes, vec![0; 16]);
        assert_eq!(t.compute.acquired_views(), 2);
    }

    #[test]
    fn missing_acquire_reads_stale_source() {
        let mut t = layered(&[255, 0, 0, 255].repeat(4));
        // Runtime A overwrites the source after the wrap snapshot.
        let ctx = t.present.create_command_context().unwrap();
        let green = t
            .present
            .create_texture(
                &desc(UsageFlags::SHADER_READ),
                Some(&[0, 255, 0, 255].repeat(4)),
                ResourceState::CopySource,
            )
            .unwrap();
        let src_texture = t.source_texture;
        t.present.reset_context(ctx).unwrap();
        for command in [
            Command::Transition {
                texture: src_texture,
                before: ResourceState::NonPixelShaderResource,
                after: ResourceState::CopyDest,
            },
            Command::Copy {
                src: green,
                dst: src_texture,
            },
            Command::Transition {
                texture: src_texture,
                before: ResourceState::CopyDest,
                after: ResourceState::NonPixelShaderResource,
            },
        ] {
            t.present.record(ctx, &command).unwrap();
        }
        t.present.close_context(ctx).unwrap();
        t.present.execute(ctx).unwrap();

        // Only the result is acquired: the kernel still sees the red snapshot.
        t.compute.acquire(&[t.result]).unwrap();
        t.compute.dispatch(&kernel(), t.source, t.result).unwrap();
        t.compute.release(&[t.result]).unwrap();
        t.compute.flush().unwrap();
        let stale = t
            .present
            .read_texture(t.result_texture, ResourceState::CopySource)
            .unwrap();
        assert_eq!(stale, [76, 76, 76, 255].repeat(4));

        // With the source acquired the copy is visible.
        t.compute.acquire(&[t.source, t.result]).unwrap();
        t.compute.dispatch(&kernel(), t.source, t.result).unwrap();
        t.compute.release(&[t.source, t.result]).unwrap();
        t.compute.flush().unwrap();
        t.present.signal(t.fence, 1).unwrap();
        t.present.wait_for(t.fence, 1).unwrap();
        let fresh = t
            .present
            .read_texture(t.result_texture, ResourceState::CopySource)
            .unwrap();
        assert_eq!(fresh, [150, 150, 150, 255].repeat(4));
    }

    #[test]
    fn unbalanced_acquire_release_is_misuse() {
        let mut t = layered(&[0; 16]);
        let err = t.compute.release(&[t.source]).unwrap_err();
        assert!(matches!(err, InteropError::SynchronizationMisuse { .. }));
        t.compute.acquire(&[t.source]).unwrap();
        let err = t.compute.acquire(&[t.source, t.result]).unwrap_err();
        assert!(matches!(err, InteropError::SynchronizationMisuse { .. }));
        // The failed call must not have acquired the result.
        assert_eq!(t.compute.acquired_views(), 1);
    }

    #[test]
    fn native_device_cannot_wrap() {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let mut present = SoftPresentDevice::new(&adapter);
        let mut compute = SoftComputeDevice::native(&adapter);
        let d = desc(UsageFlags::SHADER_READ);
        let texture = present
            .create_texture(&d, None, ResourceState::Common)
            .unwrap();
        let err = compute
            .wrap(
                &present.resource(texture).unwrap(),
                &d,
                UsageFlags::SHADER_READ,
                ResourceState::Common,
                ResourceState::Common,
            )
            .unwrap_err();
        assert_eq!(err.step(), Some(InteropStep::DeviceWrap));
    }

    #[test]
    fn import_must_match_the_exported_description() {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let mut present = SoftPresentDevice::new(&adapter);
        let mut compute = SoftComputeDevice::native(&adapter);
        let d = TextureDesc::new(8, 8, TextureFormat::Rgba8Unorm)
            .with_usage(UsageFlags::RENDER_TARGET | UsageFlags::SHADER_READ)
            .with_sharing(SharingMode::Exported);
        let texture = present
            .create_texture(&d, None, ResourceState::Common)
            .unwrap();
        let export = present.export_shared(texture, SharedAccess::READ).unwrap();

        let mut resized = export;
        resized.desc.width = 16;
        let err = compute
            .open_shared(&resized, UsageFlags::SHADER_READ)
            .unwrap_err();
        assert_eq!(err.step(), Some(InteropStep::HandleImport));

        let err = compute
            .open_shared(&export, UsageFlags::UNORDERED_WRITE)
            .unwrap_err();
        assert_eq!(err.step(), Some(InteropStep::HandleImport));

        compute.open_shared(&export, UsageFlags::SHADER_READ).unwrap();
    }
}
