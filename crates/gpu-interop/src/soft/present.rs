use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use interop_core::{
    InteropError, InteropStep, Result, SharingMode, TextureDesc, TextureFormat, UsageFlags,
};
use tracing::debug;

use super::adapter::{QueueId, SharedObject, SoftAdapter, Work};
use super::lock;
use super::memory::MemoryBlock;
use crate::runtime::{
    AdapterInfo, Command, ContextId, FenceId, PresentRuntime, ResourceState, SharedAccess,
    SharedHandle, SharedHandleExport, TextureId,
};

/// Non-owning reference to a soft texture, handed to a layered compute device
/// for wrapping.
#[derive(Debug, Clone)]
pub struct SoftResource {
    pub(crate) block: Weak<MemoryBlock>,
    pub(crate) device: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextState {
    Closed,
    Recording,
}

struct SoftContext {
    state: ContextState,
    commands: Vec<Command>,
    in_flight: Arc<AtomicBool>,
}

struct SwapChain {
    buffers: Vec<TextureId>,
    current: u32,
}

/// Runtime A on the software adapter. Presents into offscreen back buffers.
pub struct SoftPresentDevice {
    adapter: SoftAdapter,
    device: u64,
    queue: QueueId,
    textures: HashMap<TextureId, Arc<MemoryBlock>>,
    fences: HashMap<FenceId, bool>,
    contexts: HashMap<ContextId, SoftContext>,
    swap_chain: Option<SwapChain>,
    presented: Arc<AtomicU64>,
}

impl SoftPresentDevice {
    pub fn new(adapter: &SoftAdapter) -> Self {
        let device = adapter.next_id();
        let queue = adapter.create_queue();
        debug!("Soft presentation device {device} on '{}'", adapter.info().name);
        Self {
            adapter: adapter.clone(),
            device,
            queue,
            textures: HashMap::new(),
            fences: HashMap::new(),
            contexts: HashMap::new(),
            swap_chain: None,
            presented: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn soft_adapter(&self) -> &SoftAdapter {
        &self.adapter
    }

    pub(crate) fn device_id(&self) -> u64 {
        self.device
    }

    pub(crate) fn queue(&self) -> QueueId {
        self.queue
    }

    /// Presents the queue has retired so far.
    pub fn present_count(&self) -> u64 {
        self.presented.load(Ordering::SeqCst)
    }

    /// Live textures, swap chain buffers included.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn block(&self, texture: TextureId, step: InteropStep) -> Result<&Arc<MemoryBlock>> {
        self.textures
            .get(&texture)
            .ok_or_else(|| InteropError::submission(step, format!("unknown texture {texture}")))
    }

    fn context(&mut self, context: ContextId) -> Result<&mut SoftContext> {
        self.contexts.get_mut(&context).ok_or_else(|| {
            InteropError::submission(
                InteropStep::CommandRecording,
                format!("unknown command context {context}"),
            )
        })
    }

    fn fence(&self, fence: FenceId) -> Result<u64> {
        if self.fences.contains_key(&fence) {
            Ok(fence.raw())
        } else {
            Err(InteropError::submission(
                InteropStep::FenceWait,
                format!("unknown fence {fence}"),
            ))
        }
    }

    fn to_work(&self, command: &Command) -> Result<Work> {
        let step = InteropStep::CommandRecording;
        Ok(match *command {
            Command::Transition {
                texture,
                before,
                after,
            } => Work::Transition {
                texture: Arc::downgrade(self.block(texture, step)?),
                before,
                after,
            },
            Command::Copy { src, dst } => Work::Copy {
                src: Arc::downgrade(self.block(src, step)?),
                dst: Arc::downgrade(self.block(dst, step)?),
            },
        })
    }
}

impl PresentRuntime for SoftPresentDevice {
    type Resource = SoftResource;

    fn adapter(&self) -> &AdapterInfo {
        self.adapter.info()
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: Option<&[u8]>,
        state: ResourceState,
    ) -> Result<TextureId> {
        desc.validate(self.adapter.info().max_texture_dimension)?;
        let bytes = match initial {
            Some(bytes) if bytes.len() != desc.byte_len() => {
                return Err(InteropError::resource(
                    InteropStep::TextureAllocation,
                    format!(
                        "initial data is {} bytes, the texture needs {}",
                        bytes.len(),
                        desc.byte_len()
                    ),
                ))
            }
            Some(bytes) => bytes.to_vec(),
            None => vec![0; desc.byte_len()],
        };
        let id = TextureId::from_raw(self.adapter.next_id());
        self.textures
            .insert(id, Arc::new(MemoryBlock::new(self.device, *desc, bytes, state)));
        Ok(id)
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc> {
        Ok(self.block(texture, InteropStep::TextureAllocation)?.desc)
    }

    fn resource(&self, texture: TextureId) -> Result<SoftResource> {
        let block = self.block(texture, InteropStep::DeviceWrap)?;
        Ok(SoftResource {
            block: Arc::downgrade(block),
            device: self.device,
        })
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn export_shared(
        &mut self,
        texture: TextureId,
        access: SharedAccess,
    ) -> Result<SharedHandleExport> {
        let block = self.block(texture, InteropStep::HandleExport)?;
        let desc = block.desc;
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
        let handle = self.adapter.share(SharedObject::Texture {
            block: Arc::downgrade(block),
            desc,
            access,
        });
        debug!("Exported {texture} as shared handle {:#x}", handle.0);
        Ok(SharedHandleExport {
            handle,
            access,
            desc,
        })
    }

    fn close_shared(&mut self, handle: SharedHandle) {
        self.adapter.close_shared(handle);
    }

    fn create_fence(&mut self, initial: u64, shared: bool) -> Result<FenceId> {
        let fence = FenceId::from_raw(self.adapter.create_fence(initial));
        self.fences.insert(fence, shared);
        Ok(fence)
    }

    fn export_fence(&mut self, fence: FenceId) -> Result<SharedHandle> {
        match self.fences.get(&fence) {
            Some(true) => Ok(self.adapter.share(SharedObject::Fence(fence.raw()))),
            Some(false) => Err(InteropError::capability(
                InteropStep::HandleExport,
                format!("{fence} was not created shareable"),
            )),
            None => Err(InteropError::resource(
                InteropStep::HandleExport,
                format!("unknown fence {fence}"),
            )),
        }
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        if self.fences.remove(&fence).is_some() {
            self.adapter.release_fence(fence.raw());
        }
    }

    fn create_command_context(&mut self) -> Result<ContextId> {
        let id = ContextId::from_raw(self.adapter.next_id());
        self.contexts.insert(
            id,
            SoftContext {
                state: ContextState::Closed,
                commands: Vec::new(),
                in_flight: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(id)
    }

    fn reset_context(&mut self, context: ContextId) -> Result<()> {
        let ctx = self.context(context)?;
        if ctx.in_flight.load(Ordering::SeqCst) {
            return Err(InteropError::submission(
                InteropStep::CommandRecording,
                format!("{context} reset while its previous commands are still executing"),
            ));
        }
        ctx.state = ContextState::Recording;
        ctx.commands.clear();
        Ok(())
    }

    fn record(&mut self, context: ContextId, command: &Command) -> Result<()> {
        // Validate the referenced textures now, as a real command list would.
        self.to_work(command)?;
        let ctx = self.context(context)?;
        if ctx.state != ContextState::Recording {
            return Err(InteropError::submission(
                InteropStep::CommandRecording,
                format!("{context} is closed"),
            ));
        }
        ctx.commands.push(*command);
        Ok(())
    }

    fn close_context(&mut self, context: ContextId) -> Result<()> {
        let ctx = self.context(context)?;
        if ctx.state != ContextState::Recording {
            return Err(InteropError::submission(
                InteropStep::CommandRecording,
                format!("{context} closed twice"),
            ));
        }
        ctx.state = ContextState::Closed;
        Ok(())
    }

    fn execute(&mut self, context: ContextId) -> Result<()> {
        let (commands, in_flight) = {
            let ctx = self.context(context)?;
            if ctx.state != ContextState::Closed {
                return Err(InteropError::submission(
                    InteropStep::Submission,
                    format!("{context} executed while still recording"),
                ));
            }
            (ctx.commands.clone(), ctx.in_flight.clone())
        };
        let mut work = commands
            .iter()
            .map(|command| self.to_work(command))
            .collect::<Result<Vec<_>>>()?;
        in_flight.store(true, Ordering::SeqCst);
        work.push(Work::Complete(in_flight));
        self.adapter.submit(self.queue, work);
        Ok(())
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let fence = self.fence(fence)?;
        self.adapter.submit(self.queue, [Work::Signal { fence, value }]);
        Ok(())
    }

    fn queue_wait(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let fence = self.fence(fence)?;
        self.adapter.submit(self.queue, [Work::Wait { fence, value }]);
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        let raw = self.fence(fence)?;
        self.adapter.fence_value(raw).ok_or_else(|| {
            InteropError::submission(InteropStep::FenceWait, format!("{fence} was destroyed"))
        })
    }

    fn wait_for(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let fence = self.fence(fence)?;
        self.adapter.wait_until(fence, value)
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
        if let Some(old) = self.swap_chain.take() {
            for buffer in old.buffers {
                self.destroy_texture(buffer);
            }
        }
        let desc = TextureDesc::new(width, height, format).with_usage(UsageFlags::RENDER_TARGET);
        let buffers = (0..buffer_count)
            .map(|_| self.create_texture(&desc, None, ResourceState::Present))
            .collect::<Result<Vec<_>>>()?;
        debug!("Soft swap chain {width}x{height} {format:?} with {buffer_count} buffers");
        self.swap_chain = Some(SwapChain {
            buffers,
            current: 0,
        });
        Ok(())
    }

    fn back_buffer(&self, index: u32) -> Result<TextureId> {
        self.swap_chain
            .as_ref()
            .and_then(|chain| chain.buffers.get(index as usize).copied())
            .ok_or_else(|| {
                InteropError::submission(
                    InteropStep::Present,
                    format!("no back buffer {index}"),
                )
            })
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.swap_chain.as_ref().map_or(0, |chain| chain.current)
    }

    fn present(&mut self) -> Result<()> {
        let chain = self.swap_chain.as_mut().ok_or_else(|| {
            InteropError::submission(InteropStep::Present, "present without a swap chain")
        })?;
        let target = chain.buffers[chain.current as usize];
        chain.current = (chain.current + 1) % chain.buffers.len() as u32;
        let target = Arc::downgrade(self.block(target, InteropStep::Present)?);
        self.adapter.submit(
            self.queue,
            [Work::Present {
                target,
                presented: self.presented.clone(),
            }],
        );
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureId, state: ResourceState) -> Result<Vec<u8>> {
        self.adapter.drain()?;
        let block = self.block(texture, InteropStep::Readback)?;
        let contents = lock(&block.contents);
        if contents.state != state {
            return Err(InteropError::submission(
                InteropStep::Readback,
                format!(
                    "{texture} is in state {:?}, readback expected {state:?}",
                    contents.state
                ),
            ));
        }
        Ok(contents.bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftAdapterConfig;

    fn device() -> SoftPresentDevice {
        SoftPresentDevice::new(&SoftAdapter::new(SoftAdapterConfig::default()))
    }

    fn rgba(width: u32, height: u32) -> TextureDesc {
        TextureDesc::new(width, height, TextureFormat::Rgba8Unorm)
    }

    #[test]
    fn copy_requires_barriers() {
        let mut dev = device();
        let src = dev
            .create_texture(&rgba(2, 2), Some(&[9; 16]), ResourceState::CopySource)
            .unwrap();
        let dst = dev
            .create_texture(&rgba(2, 2), None, ResourceState::Present)
            .unwrap();
        let ctx = dev.create_command_context().unwrap();

        // Missing Present -> CopyDest barrier faults the device.
        dev.reset_context(ctx).unwrap();
        dev.record(ctx, &Command::Copy { src, dst }).unwrap();
        dev.close_context(ctx).unwrap();
        dev.execute(ctx).unwrap();
        assert!(dev.read_texture(dst, ResourceState::Present).is_err());
    }

    #[test]
    fn copy_with_barriers_moves_texels() {
        let mut dev = device();
        let src = dev
            .create_texture(&rgba(2, 2), Some(&[9; 16]), ResourceState::CopySource)
            .unwrap();
        let dst = dev
            .create_texture(&rgba(2, 2), None, ResourceState::Present)
            .unwrap();
        let ctx = dev.create_command_context().unwrap();
        dev.reset_context(ctx).unwrap();
        for command in [
            Command::Transition {
                texture: dst,
                before: ResourceState::Present,
                after: ResourceState::CopyDest,
            },
            Command::Copy { src, dst },
            Command::Transition {
                texture: dst,
                before: ResourceState::CopyDest,
                after: ResourceState::Present,
            },
        ] {
            dev.record(ctx, &command).unwrap();
        }
        dev.close_context(ctx).unwrap();
        dev.execute(ctx).unwrap();
        assert_eq!(dev.read_texture(dst, ResourceState::Present).unwrap(), vec![9; 16]);
    }

    #[test]
    fn in_flight_context_cannot_be_reset() {
        let mut dev = device();
        let ctx = dev.create_command_context().unwrap();
        dev.reset_context(ctx).unwrap();
        dev.close_context(ctx).unwrap();
        dev.execute(ctx).unwrap();
        assert!(dev.reset_context(ctx).is_err());

        let fence = dev.create_fence(0, false).unwrap();
        dev.signal(fence, 1).unwrap();
        dev.wait_for(fence, 1).unwrap();
        dev.reset_context(ctx).unwrap();
    }

    #[test]
    fn export_requires_render_target_on_shared_heap() {
        let mut dev = device();
        let plain = dev
            .create_texture(
                &rgba(4, 4).with_usage(UsageFlags::SHADER_READ),
                None,
                ResourceState::Common,
            )
            .unwrap();
        let err = dev.export_shared(plain, SharedAccess::ALL).unwrap_err();
        assert_eq!(err.step(), Some(InteropStep::HandleExport));

        let shared = dev
            .create_texture(
                &rgba(4, 4)
                    .with_usage(UsageFlags::RENDER_TARGET)
                    .with_sharing(SharingMode::Exported),
                None,
                ResourceState::Common,
            )
            .unwrap();
        let export = dev.export_shared(shared, SharedAccess::READ).unwrap();
        assert_eq!(export.desc.width, 4);
        assert_eq!(export.access, SharedAccess::READ);
    }

    #[test]
    fn swap_chain_rotates_and_counts_presents() {
        let mut dev = device();
        dev.create_swap_chain(2, 2, TextureFormat::Bgra8Unorm, 3).unwrap();
        let first = dev.back_buffer(0).unwrap();
        assert_eq!(dev.current_back_buffer_index(), 0);
        dev.present().unwrap();
        dev.present().unwrap();
        assert_eq!(dev.current_back_buffer_index(), 2);
        dev.present().unwrap();
        assert_eq!(dev.current_back_buffer_index(), 0);
        assert_eq!(dev.present_count(), 0);
        dev.read_texture(first, ResourceState::Present).unwrap();
        assert_eq!(dev.present_count(), 3);
    }

    #[test]
    fn oversized_texture_is_a_capability_error() {
        let adapter = SoftAdapter::new(SoftAdapterConfig {
            max_texture_dimension: 64,
            ..SoftAdapterConfig::default()
        });
        let mut dev = SoftPresentDevice::new(&adapter);
        let err = dev
            .create_texture(&rgba(65, 1), None, ResourceState::Common)
            .unwrap_err();
        assert!(matches!(err, InteropError::Capability { .. }));
    }
}
