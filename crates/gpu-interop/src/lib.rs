//! Cross-runtime GPU texture bridging.
//!
//! This crate defines the two runtime contracts ([`PresentRuntime`] and
//! [`ComputeRuntime`]), the [`InteropBridge`] that aliases textures between
//! them, and the synchronization primitives that order their work. Two
//! backends implement the contracts: a deterministic software adapter that
//! runs everywhere, and D3D12 presentation with D3D11 compute on Windows.

pub mod bridge;
pub mod runtime;
pub mod soft;
pub mod sync;

pub use bridge::{AliasedTexture, InteropBridge, RuntimeAliasPair, SharingStrategy};
pub use runtime::{
    AdapterInfo, Command, ComputeRuntime, ContextId, DeviceAttachment, FenceId, PresentRuntime,
    ResourceState, SharedAccess, SharedHandle, SharedHandleExport, TextureId, ViewId,
};
pub use sync::{AcquireScope, FenceCounter, FenceHandoff, HandoffFence};

// Platform-specific implementations.

#[cfg(target_os = "windows")]
pub mod d3d12;
