//! Frame slots.

use gpu_interop::{ContextId, TextureId};
use interop_core::{InteropError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    /// Executed; `fence_value` has not been observed yet.
    Submitted,
}

/// One of the rotating per-frame records: a command context, the back buffer
/// it presents into and the fence value that retires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub context: ContextId,
    pub target: TextureId,
    /// The slot's context may not be reset before the frame fence reaches
    /// this value.
    pub fence_value: u64,
    state: SlotState,
}

impl FrameSlot {
    pub fn new(context: ContextId, target: TextureId) -> Self {
        Self {
            context,
            target,
            fence_value: 0,
            state: SlotState::Idle,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The frame fence reached `fence_value`.
    pub fn retire(&mut self) {
        if self.state == SlotState::Submitted {
            self.state = SlotState::Idle;
        }
    }

    pub fn begin_recording(&mut self) -> Result<()> {
        if self.state != SlotState::Idle {
            return Err(InteropError::misuse(format!(
                "recording into a frame slot that is {:?}",
                self.state
            )));
        }
        self.state = SlotState::Recording;
        Ok(())
    }

    pub fn submit(&mut self, fence_value: u64) -> Result<()> {
        if self.state != SlotState::Recording {
            return Err(InteropError::misuse(format!(
                "submitting a frame slot that is {:?}",
                self.state
            )));
        }
        self.fence_value = fence_value;
        self.state = SlotState::Submitted;
        Ok(())
    }

    /// Recording failed; nothing was submitted.
    pub fn abandon(&mut self) {
        if self.state == SlotState::Recording {
            self.state = SlotState::Idle;
        }
    }
}
