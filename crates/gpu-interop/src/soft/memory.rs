use std::sync::{Arc, Mutex, Weak};

use interop_core::{InteropError, InteropStep, Result, TextureDesc};

use super::lock;
use crate::runtime::ResourceState;

/// Texture memory owned by a presentation device.
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    /// Presentation device that allocated the block.
    pub device: u64,
    pub desc: TextureDesc,
    pub contents: Mutex<Contents>,
}

#[derive(Debug)]
pub(crate) struct Contents {
    pub bytes: Vec<u8>,
    pub state: ResourceState,
}

impl MemoryBlock {
    pub fn new(device: u64, desc: TextureDesc, bytes: Vec<u8>, state: ResourceState) -> Self {
        Self {
            device,
            desc,
            contents: Mutex::new(Contents { bytes, state }),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.contents).bytes.clone()
    }
}

/// Upgrade a queued reference, turning a freed block into a device fault.
pub(crate) fn resolve(block: &Weak<MemoryBlock>, what: &str) -> Result<Arc<MemoryBlock>> {
    block.upgrade().ok_or_else(|| {
        InteropError::submission(
            InteropStep::Submission,
            format!("device fault: {what} was freed while queued work still referenced it"),
        )
    })
}

/// A compute-side view created by wrapping a presentation resource.
#[derive(Debug)]
pub(crate) struct WrappedView {
    pub block: Weak<MemoryBlock>,
    pub desc: TextureDesc,
    pub in_state: ResourceState,
    pub out_state: ResourceState,
    /// The compute runtime's copy of the texels. Only synchronized with the
    /// block by acquire and release.
    pub cache: Mutex<Vec<u8>>,
}

/// What a queued dispatch reads or writes.
#[derive(Debug, Clone)]
pub(crate) enum Binding {
    Wrapped(Arc<WrappedView>),
    Direct {
        block: Weak<MemoryBlock>,
        desc: TextureDesc,
    },
}

impl Binding {
    pub fn desc(&self) -> TextureDesc {
        match self {
            Self::Wrapped(view) => view.desc,
            Self::Direct { desc, .. } => *desc,
        }
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            Self::Wrapped(view) => Ok(lock(&view.cache).clone()),
            Self::Direct { block, .. } => Ok(resolve(block, "kernel source")?.snapshot()),
        }
    }

    /// Run `f` on the bound texels with write access.
    pub fn write<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> Result<T> {
        match self {
            Self::Wrapped(view) => Ok(f(lock(&view.cache).as_mut_slice())),
            Self::Direct { block, .. } => {
                let block = resolve(block, "kernel result")?;
                let mut contents = lock(&block.contents);
                Ok(f(contents.bytes.as_mut_slice()))
            }
        }
    }
}
