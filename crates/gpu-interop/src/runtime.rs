//! The two runtime contracts the bridge is built on.
//!
//! [`PresentRuntime`] ("Runtime A") owns texture memory, records transfer
//! commands into command contexts, submits them to its queue and presents
//! through a swap chain. [`ComputeRuntime`] ("Runtime B") never allocates the
//! bridged textures; it only builds views over memory that Runtime A owns,
//! either by wrapping A's resource objects on a shared device or by importing
//! an OS shared handle on an independent device.
//!
//! Objects are referred to by small copyable ids. Each runtime keeps its own
//! id space; an id is only meaningful to the runtime that issued it.

use std::fmt;
use std::sync::Arc;

use interop_core::{
    InteropError, InteropStep, Kernel, Result, TextureDesc, TextureFormat, UsageFlags,
};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

object_id!(
    /// A texture owned by the presentation runtime.
    TextureId
);
object_id!(
    /// A compute-runtime view over presentation-runtime memory.
    ViewId
);
object_id!(
    /// A fence, in the id space of the runtime that created or opened it.
    FenceId
);
object_id!(
    /// A command allocator + command list pair.
    ContextId
);

/// Raw OS handle value for an exported texture or fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedHandle(pub u64);

/// Resource state as tracked by the presentation runtime's barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopySource,
    CopyDest,
    NonPixelShaderResource,
    UnorderedAccess,
    RenderTarget,
    Present,
}

/// A command recorded into a presentation-runtime command context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Transition {
        texture: TextureId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Whole-resource copy between textures of identical layout.
    Copy { src: TextureId, dst: TextureId },
}

bitflags::bitflags! {
    /// Access rights granted with an exported shared handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SharedAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ALL = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// An exported texture: the OS handle plus the metadata the importing side
/// must replicate exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedHandleExport {
    pub handle: SharedHandle,
    pub access: SharedAccess,
    pub desc: TextureDesc,
}

/// How a compute runtime is attached to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttachment {
    /// Layered on the presentation runtime's device and queue. Can wrap
    /// presentation-runtime resources directly.
    Layered,
    /// An independent device instance with its own queue. Can only reach
    /// presentation-runtime memory through shared handles.
    Native,
}

const WARP_VENDOR_ID: u32 = 0x1414;
const WARP_DEVICE_ID: u32 = 0x8c;

/// The adapter a presentation runtime was created on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    /// Reported by the driver as a software rasterizer.
    pub software: bool,
    pub max_texture_dimension: u32,
}

impl AdapterInfo {
    /// Microsoft Basic Render Driver.
    pub fn is_warp(&self) -> bool {
        self.vendor_id == WARP_VENDOR_ID && self.device_id == WARP_DEVICE_ID
    }

    /// Window-title suffix identifying non-hardware adapters.
    pub fn title_suffix(&self) -> &'static str {
        if self.is_warp() {
            " (WARP)"
        } else if self.software {
            " (Software)"
        } else {
            ""
        }
    }
}

/// Buffer-count limits of a flip-model window swap chain.
pub const FLIP_MIN_BUFFERS: u32 = 2;
pub const FLIP_MAX_BUFFERS: u32 = 16;

/// Reject window swap chains a flip-model presenter cannot create.
pub fn check_flip_swap_chain(format: TextureFormat, buffer_count: u32) -> Result<()> {
    if !(FLIP_MIN_BUFFERS..=FLIP_MAX_BUFFERS).contains(&buffer_count) {
        return Err(InteropError::capability(
            InteropStep::Present,
            format!(
                "a window swap chain needs {FLIP_MIN_BUFFERS} to {FLIP_MAX_BUFFERS} buffers, \
                 {buffer_count} requested"
            ),
        ));
    }
    if format == TextureFormat::Rgba16Unorm {
        return Err(InteropError::capability(
            InteropStep::Present,
            format!("{format:?} cannot back a window swap chain; use Rgba8Unorm or Bgra8Unorm"),
        ));
    }
    Ok(())
}

/// Runtime A: owns texture memory, records and submits transfer work, and
/// presents.
pub trait PresentRuntime {
    /// Native resource object a layered compute runtime wraps.
    type Resource: Clone;

    fn adapter(&self) -> &AdapterInfo;

    /// Allocate a texture in `state`, optionally filled with tightly packed
    /// `initial` texels. Uploads are queued and complete before any later
    /// submission on this runtime's queue.
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: Option<&[u8]>,
        state: ResourceState,
    ) -> Result<TextureId>;

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc>;

    /// The native resource behind `texture`, for wrapping.
    fn resource(&self, texture: TextureId) -> Result<Self::Resource>;

    /// Free a texture's memory. Every compute view of it must already be
    /// released.
    fn destroy_texture(&mut self, texture: TextureId);

    /// Export `texture` through an OS shared handle. The texture must have
    /// been created render-target eligible with [`SharingMode::Exported`].
    ///
    /// [`SharingMode::Exported`]: interop_core::SharingMode::Exported
    fn export_shared(
        &mut self,
        texture: TextureId,
        access: SharedAccess,
    ) -> Result<SharedHandleExport>;

    fn close_shared(&mut self, handle: SharedHandle);

    fn create_fence(&mut self, initial: u64, shared: bool) -> Result<FenceId>;

    fn export_fence(&mut self, fence: FenceId) -> Result<SharedHandle>;

    fn destroy_fence(&mut self, fence: FenceId);

    fn create_command_context(&mut self) -> Result<ContextId>;

    /// Reset a context for recording. Fails if the GPU may still be executing
    /// its previous commands.
    fn reset_context(&mut self, context: ContextId) -> Result<()>;

    fn record(&mut self, context: ContextId, command: &Command) -> Result<()>;

    fn close_context(&mut self, context: ContextId) -> Result<()>;

    /// Submit a closed context to the queue.
    fn execute(&mut self, context: ContextId) -> Result<()>;

    /// Queue-side signal: `fence` reaches `value` once all prior queue work
    /// completes.
    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()>;

    /// Queue-side wait: later queue work does not start before `fence`
    /// reaches `value`.
    fn queue_wait(&mut self, fence: FenceId, value: u64) -> Result<()>;

    fn completed_value(&self, fence: FenceId) -> Result<u64>;

    /// Block the host until `fence` reaches `value`. No timeout.
    fn wait_for(&mut self, fence: FenceId, value: u64) -> Result<()>;

    /// Create a swap chain of `buffer_count` presentable textures.
    fn create_swap_chain(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        buffer_count: u32,
    ) -> Result<()>;

    fn back_buffer(&self, index: u32) -> Result<TextureId>;

    fn current_back_buffer_index(&self) -> u32;

    fn present(&mut self) -> Result<()>;

    /// Copy `texture` (currently in `state`) back to host memory, waiting for
    /// all submitted work first.
    fn read_texture(&mut self, texture: TextureId, state: ResourceState) -> Result<Vec<u8>>;
}

/// Runtime B: builds views over presentation-runtime memory and runs kernels.
pub trait ComputeRuntime {
    type Present: PresentRuntime;

    fn attachment(&self) -> DeviceAttachment;

    /// Wrap a presentation-runtime resource. The resource must be in
    /// `in_state` whenever the view is acquired, and is left in `out_state` on
    /// release. Only layered runtimes can wrap.
    fn wrap(
        &mut self,
        resource: &<Self::Present as PresentRuntime>::Resource,
        desc: &TextureDesc,
        usage: UsageFlags,
        in_state: ResourceState,
        out_state: ResourceState,
    ) -> Result<ViewId>;

    /// Import an exported texture. The export's description must match the
    /// shared memory exactly.
    fn open_shared(&mut self, export: &SharedHandleExport, usage: UsageFlags) -> Result<ViewId>;

    fn release_view(&mut self, view: ViewId);

    /// Take ownership of wrapped views from the presentation runtime.
    fn acquire(&mut self, views: &[ViewId]) -> Result<()>;

    /// Hand wrapped views back to the presentation runtime.
    fn release(&mut self, views: &[ViewId]) -> Result<()>;

    /// Record one kernel launch over every texel of `result`.
    fn dispatch(&mut self, kernel: &Arc<dyn Kernel>, source: ViewId, result: ViewId)
        -> Result<()>;

    /// Submit everything recorded so far.
    fn flush(&mut self) -> Result<()>;

    fn open_fence(&mut self, handle: SharedHandle) -> Result<FenceId>;

    fn close_fence(&mut self, fence: FenceId);

    fn signal(&mut self, fence: FenceId, value: u64) -> Result<()>;

    fn queue_wait(&mut self, fence: FenceId, value: u64) -> Result<()>;
}
