//! Interop resource bridge.
//!
//! The bridge owns both runtimes and every texture it shares between them.
//! Runtime A allocates; Runtime B only ever holds non-owning views, which are
//! released before the memory they alias is freed.

use interop_core::{InteropError, InteropStep, Result, SharingMode, TextureDesc, UsageFlags};
use tracing::{debug, error, warn};

use crate::runtime::{
    Command, ComputeRuntime, ContextId, DeviceAttachment, FenceId, PresentRuntime, ResourceState,
    SharedAccess, SharedHandle, SharedHandleExport, TextureId, ViewId,
};
use crate::sync::{FenceCounter, HandoffFence};

/// How the compute runtime reaches the bridged memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SharingStrategy {
    /// Wrap Runtime A's resources from a compute runtime layered on the same
    /// device. Every dispatch must be bracketed by acquire/release.
    #[default]
    SameDevice,
    /// Export OS shared handles from Runtime A and import them on an
    /// independent compute device. Queues are ordered by a shared fence.
    CrossDevice,
}

impl SharingStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::SameDevice => "same-device wrapping",
            Self::CrossDevice => "cross-device export/import",
        }
    }
}

/// One logical texture as seen by both runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasedTexture {
    /// Runtime A texture whose memory the view aliases.
    pub texture: TextureId,
    /// Runtime B view of `texture`.
    pub view: ViewId,
    pub desc: TextureDesc,
    /// Non-shareable original that was copied into `texture` before export.
    pub origin: Option<TextureId>,
    pub export: Option<SharedHandleExport>,
}

/// Source and result of one kernel, aliased across both runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeAliasPair {
    pub source: AliasedTexture,
    pub result: AliasedTexture,
    pub strategy: SharingStrategy,
    /// State the result texture is in whenever Runtime A records work
    /// against it.
    pub result_state: ResourceState,
    /// Present for cross-device pairs only.
    pub handoff: Option<HandoffFence>,
}

/// Something the bridge created and must release.
#[derive(Debug, Clone, Copy)]
enum Created {
    Texture(TextureId),
    Export(SharedHandle),
    View(ViewId),
    PresentFence(FenceId),
    ComputeFence(FenceId),
}

pub struct InteropBridge<C: ComputeRuntime> {
    // Declared first so the compute runtime is dropped before the device it
    // may be layered on.
    compute: C,
    present: C::Present,
    pairs: Vec<(RuntimeAliasPair, Vec<Created>)>,
    idle: FenceCounter,
    /// Fence the host waits on for an independent compute queue to drain.
    /// `None` when compute work runs on Runtime A's queue.
    compute_idle: Option<(HandoffFence, FenceCounter)>,
    setup_context: Option<ContextId>,
}

impl<C: ComputeRuntime> InteropBridge<C> {
    pub fn new(mut present: C::Present, mut compute: C) -> Result<Self> {
        let fence = present.create_fence(0, false)?;
        let compute_idle = match compute.attachment() {
            DeviceAttachment::Layered => None,
            DeviceAttachment::Native => {
                let shared = present.create_fence(0, true)?;
                let opened = present
                    .export_fence(shared)
                    .and_then(|handle| Ok((handle, compute.open_fence(handle)?)));
                let (handle, opened) = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        present.destroy_fence(shared);
                        present.destroy_fence(fence);
                        return Err(e);
                    }
                };
                let idle = HandoffFence {
                    present: shared,
                    compute: opened,
                    handle,
                };
                Some((idle, FenceCounter::new(shared, 0)))
            }
        };
        debug!(
            "Interop bridge on {} ({:?} compute device)",
            present.adapter().name,
            compute.attachment()
        );
        Ok(Self {
            compute,
            present,
            pairs: Vec::new(),
            idle: FenceCounter::new(fence, 0),
            compute_idle,
            setup_context: None,
        })
    }

    pub fn present(&self) -> &C::Present {
        &self.present
    }

    pub fn present_mut(&mut self) -> &mut C::Present {
        &mut self.present
    }

    pub fn compute(&self) -> &C {
        &self.compute
    }

    pub fn compute_mut(&mut self) -> &mut C {
        &mut self.compute
    }

    /// Both runtimes at once, for work that touches each in turn.
    pub fn runtimes_mut(&mut self) -> (&mut C::Present, &mut C) {
        (&mut self.present, &mut self.compute)
    }

    /// Allocate `source` (filled with `texels`) and `result` on Runtime A and
    /// make both visible to Runtime B using `strategy`.
    ///
    /// Initial uploads and staging copies have completed when this returns.
    /// Any failure is fatal for the pair; everything created so far is
    /// released before the error is returned.
    pub fn create_aliased_pair(
        &mut self,
        source: &TextureDesc,
        texels: &[u8],
        result: &TextureDesc,
        strategy: SharingStrategy,
    ) -> Result<RuntimeAliasPair> {
        self.check_pair(source, texels, result, strategy)?;

        let mut created = Vec::new();
        let built = match strategy {
            SharingStrategy::SameDevice => self.wrap_pair(source, texels, result, &mut created),
            SharingStrategy::CrossDevice => self.share_pair(source, texels, result, &mut created),
        };
        let pair = match built.and_then(|pair| self.wait_idle().map(|()| pair)) {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to create {} pair: {e}", strategy.name());
                if let Err(wait) = self.wait_idle() {
                    warn!("Releasing a partial pair without a drained queue: {wait}");
                }
                self.release_created(&created);
                return Err(e);
            }
        };

        debug!(
            "Created {} pair: source {}x{} {:?}, result {}x{} {:?}",
            strategy.name(),
            source.width,
            source.height,
            source.format,
            result.width,
            result.height,
            result.format
        );
        self.pairs.push((pair, created));
        Ok(pair)
    }

    /// Release a pair: compute views first, then OS handles, then Runtime A's
    /// memory.
    pub fn destroy_pair(&mut self, pair: &RuntimeAliasPair) -> Result<()> {
        let Some(index) = self.pairs.iter().position(|(p, _)| p == pair) else {
            return Err(InteropError::misuse("destroying a pair this bridge does not own"));
        };
        self.wait_idle()?;
        let (_, created) = self.pairs.remove(index);
        self.release_created(&created);
        Ok(())
    }

    /// Block until neither queue has work left that could reference bridged
    /// memory: an independent compute queue first, then Runtime A's queue.
    pub fn wait_idle(&mut self) -> Result<()> {
        match &mut self.compute_idle {
            Some((fence, counter)) => {
                let value = counter.next_value();
                self.compute.signal(fence.compute, value)?;
                self.compute.flush()?;
                self.present.wait_for(fence.present, value)?;
            }
            None => self.compute.flush()?,
        }
        let value = self.idle.next_value();
        self.present.signal(self.idle.fence(), value)?;
        self.present.wait_for(self.idle.fence(), value)
    }

    fn check_pair(
        &self,
        source: &TextureDesc,
        texels: &[u8],
        result: &TextureDesc,
        strategy: SharingStrategy,
    ) -> Result<()> {
        let max = self.present.adapter().max_texture_dimension;
        source.validate(max)?;
        result.validate(max)?;

        if !source.usage.contains(UsageFlags::SHADER_READ) {
            return Err(InteropError::resource(
                InteropStep::TextureAllocation,
                "kernel source must be shader-readable",
            ));
        }
        if !result.usage.contains(UsageFlags::UNORDERED_WRITE) {
            return Err(InteropError::resource(
                InteropStep::TextureAllocation,
                "kernel result must be unordered-writable",
            ));
        }
        if texels.len() != source.byte_len() {
            return Err(InteropError::resource(
                InteropStep::TextureAllocation,
                format!(
                    "source data is {} bytes, {}x{} {:?} needs {}",
                    texels.len(),
                    source.width,
                    source.height,
                    source.format,
                    source.byte_len()
                ),
            ));
        }
        if strategy == SharingStrategy::SameDevice
            && self.compute.attachment() != DeviceAttachment::Layered
        {
            return Err(InteropError::capability(
                InteropStep::DeviceWrap,
                "the compute device is not layered on the presentation device",
            ));
        }
        Ok(())
    }

    fn wrap_pair(
        &mut self,
        source: &TextureDesc,
        texels: &[u8],
        result: &TextureDesc,
        created: &mut Vec<Created>,
    ) -> Result<RuntimeAliasPair> {
        let source = self.wrap_texture(
            &source.with_sharing(SharingMode::Aliased),
            Some(texels),
            UsageFlags::SHADER_READ,
            ResourceState::NonPixelShaderResource,
            created,
        )?;
        let result = self.wrap_texture(
            &result.with_sharing(SharingMode::Aliased),
            None,
            UsageFlags::UNORDERED_WRITE,
            ResourceState::CopySource,
            created,
        )?;
        Ok(RuntimeAliasPair {
            source,
            result,
            strategy: SharingStrategy::SameDevice,
            result_state: ResourceState::CopySource,
            handoff: None,
        })
    }

    fn wrap_texture(
        &mut self,
        desc: &TextureDesc,
        initial: Option<&[u8]>,
        usage: UsageFlags,
        state: ResourceState,
        created: &mut Vec<Created>,
    ) -> Result<AliasedTexture> {
        let texture = self.present.create_texture(desc, initial, state)?;
        created.push(Created::Texture(texture));
        let resource = self.present.resource(texture)?;
        let view = self.compute.wrap(&resource, desc, usage, state, state)?;
        created.push(Created::View(view));
        Ok(AliasedTexture {
            texture,
            view,
            desc: *desc,
            origin: None,
            export: None,
        })
    }

    fn share_pair(
        &mut self,
        source: &TextureDesc,
        texels: &[u8],
        result: &TextureDesc,
        created: &mut Vec<Created>,
    ) -> Result<RuntimeAliasPair> {
        let source = if source.usage.contains(UsageFlags::RENDER_TARGET) {
            let desc = source.with_sharing(SharingMode::Exported);
            let texture = self
                .present
                .create_texture(&desc, Some(texels), ResourceState::Common)?;
            created.push(Created::Texture(texture));
            self.share_texture(texture, desc, None, UsageFlags::SHADER_READ, created)?
        } else {
            self.share_through_staging(source, texels, created)?
        };

        let desc = result
            .with_usage(result.usage | UsageFlags::RENDER_TARGET)
            .with_sharing(SharingMode::Exported);
        let texture = self
            .present
            .create_texture(&desc, None, ResourceState::Common)?;
        created.push(Created::Texture(texture));
        let result = self.share_texture(texture, desc, None, UsageFlags::UNORDERED_WRITE, created)?;

        let present_fence = self.present.create_fence(0, true)?;
        created.push(Created::PresentFence(present_fence));
        let handle = self.present.export_fence(present_fence)?;
        let compute_fence = self.compute.open_fence(handle)?;
        created.push(Created::ComputeFence(compute_fence));

        Ok(RuntimeAliasPair {
            source,
            result,
            strategy: SharingStrategy::CrossDevice,
            result_state: ResourceState::Common,
            handoff: Some(HandoffFence {
                present: present_fence,
                compute: compute_fence,
                handle,
            }),
        })
    }

    /// Copy a non-render-target source into a render-target-eligible shared
    /// surface and export that instead.
    fn share_through_staging(
        &mut self,
        source: &TextureDesc,
        texels: &[u8],
        created: &mut Vec<Created>,
    ) -> Result<AliasedTexture> {
        let origin = self
            .present
            .create_texture(source, Some(texels), ResourceState::CopySource)?;
        created.push(Created::Texture(origin));

        let desc = source
            .with_usage(source.usage | UsageFlags::RENDER_TARGET)
            .with_sharing(SharingMode::Exported);
        let staging = self
            .present
            .create_texture(&desc, None, ResourceState::CopyDest)?;
        created.push(Created::Texture(staging));

        let context = self.setup_context()?;
        self.present.reset_context(context)?;
        self.present.record(
            context,
            &Command::Copy {
                src: origin,
                dst: staging,
            },
        )?;
        self.present.record(
            context,
            &Command::Transition {
                texture: staging,
                before: ResourceState::CopyDest,
                after: ResourceState::Common,
            },
        )?;
        self.present.close_context(context)?;
        self.present.execute(context)?;
        debug!(
            "Staged {}x{} source into a shareable surface",
            source.width, source.height
        );

        self.share_texture(staging, desc, Some(origin), UsageFlags::SHADER_READ, created)
    }

    fn share_texture(
        &mut self,
        texture: TextureId,
        desc: TextureDesc,
        origin: Option<TextureId>,
        usage: UsageFlags,
        created: &mut Vec<Created>,
    ) -> Result<AliasedTexture> {
        let export = self.present.export_shared(texture, SharedAccess::ALL)?;
        created.push(Created::Export(export.handle));
        let view = self.compute.open_shared(&export, usage)?;
        created.push(Created::View(view));
        Ok(AliasedTexture {
            texture,
            view,
            desc,
            origin,
            export: Some(export),
        })
    }

    fn setup_context(&mut self) -> Result<ContextId> {
        if let Some(context) = self.setup_context {
            return Ok(context);
        }
        let context = self.present.create_command_context()?;
        self.setup_context = Some(context);
        Ok(context)
    }

    /// Release in reverse creation order, which puts every view before the
    /// handle and texture it aliases.
    fn release_created(&mut self, created: &[Created]) {
        for item in created.iter().rev() {
            match *item {
                Created::View(view) => self.compute.release_view(view),
                Created::ComputeFence(fence) => self.compute.close_fence(fence),
                Created::Export(handle) => self.present.close_shared(handle),
                Created::PresentFence(fence) => self.present.destroy_fence(fence),
                Created::Texture(texture) => self.present.destroy_texture(texture),
            }
        }
    }
}

impl<C: ComputeRuntime> Drop for InteropBridge<C> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("Failed to drain the queue before releasing interop resources: {e}");
        }
        while let Some((_, created)) = self.pairs.pop() {
            self.release_created(&created);
        }
        if let Some((fence, _)) = self.compute_idle.take() {
            self.compute.close_fence(fence.compute);
            self.present.close_shared(fence.handle);
            self.present.destroy_fence(fence.present);
        }
        self.present.destroy_fence(self.idle.fence());
    }
}
