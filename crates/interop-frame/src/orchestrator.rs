//! The steady-state frame loop.

use std::sync::Arc;

use gpu_interop::{
    Command, ComputeRuntime, FenceCounter, InteropBridge, PresentRuntime, ResourceState,
    RuntimeAliasPair, TextureId,
};
use interop_core::{InteropError, InteropStep, Kernel, Result};
use tracing::{debug, error};

use crate::dispatch::Dispatcher;
use crate::slot::{FrameSlot, SlotState};
use crate::stats::FrameStatsAccumulator;

/// Drives `frame_count` rotating frame slots over one aliased pair.
///
/// Each frame copies the kernel result into the slot's back buffer and
/// presents it. A slot is reused only after the frame fence reaches the value
/// signalled for its previous frame, so at most `frame_count - 1` frames are
/// ever queued behind the one being recorded.
pub struct FrameOrchestrator<C: ComputeRuntime> {
    bridge: InteropBridge<C>,
    dispatcher: Dispatcher,
    slots: Vec<FrameSlot>,
    fence: FenceCounter,
    frame_index: u32,
    last_presented: Option<TextureId>,
}

impl<C: ComputeRuntime> FrameOrchestrator<C> {
    /// Create the swap chain (sized to the result), one command context per
    /// slot and the frame fence.
    pub fn new(
        mut bridge: InteropBridge<C>,
        pair: RuntimeAliasPair,
        kernel: Arc<dyn Kernel>,
        frame_count: u32,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(kernel, &pair)?;
        let result = pair.result.desc;
        let present = bridge.present_mut();
        present.create_swap_chain(result.width, result.height, result.format, frame_count)?;

        let mut slots = Vec::with_capacity(frame_count as usize);
        for index in 0..frame_count {
            let context = present.create_command_context()?;
            slots.push(FrameSlot::new(context, present.back_buffer(index)?));
        }
        let fence = FenceCounter::new(present.create_fence(0, false)?, 0);
        let frame_index = present.current_back_buffer_index();
        debug!(
            "Frame orchestrator with {frame_count} slots presenting {}x{} {:?}",
            result.width, result.height, result.format
        );

        Ok(Self {
            bridge,
            dispatcher,
            slots,
            fence,
            frame_index,
            last_presented: None,
        })
    }

    pub fn bridge(&self) -> &InteropBridge<C> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut InteropBridge<C> {
        &mut self.bridge
    }

    pub fn pair(&self) -> &RuntimeAliasPair {
        self.dispatcher.pair()
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Render and present one frame.
    pub fn render_frame(&mut self, stats: &mut FrameStatsAccumulator) -> Result<()> {
        let index = self.frame_index as usize;
        let slot = *self.slots.get(index).ok_or_else(|| {
            InteropError::submission(
                InteropStep::Present,
                format!("back buffer index {index} has no frame slot"),
            )
        })?;

        if slot.state() == SlotState::Submitted {
            self.wait_for_slot(&slot, stats)?;
            self.slots[index].retire();
        }

        self.slots[index].begin_recording()?;
        if let Err(e) = self.record(&slot) {
            self.slots[index].abandon();
            error!("Failed to record frame {index}: {e}");
            return Err(e);
        }

        let (present, compute) = self.bridge.runtimes_mut();
        self.dispatcher.dispatch(compute)?;
        self.dispatcher.before_read(present)?;
        present.execute(slot.context)?;
        self.dispatcher.after_read(present)?;
        present.present()?;

        let value = self.fence.next_value();
        present.signal(self.fence.fence(), value)?;
        self.slots[index].submit(value)?;
        self.last_presented = Some(slot.target);
        self.frame_index = present.current_back_buffer_index();
        Ok(())
    }

    /// Signal a fresh frame-fence value and block until it is reached.
    pub fn wait_idle(&mut self) -> Result<()> {
        let value = self.fence.next_value();
        let present = self.bridge.present_mut();
        present.signal(self.fence.fence(), value)?;
        present.wait_for(self.fence.fence(), value)?;
        for slot in &mut self.slots {
            slot.retire();
        }
        Ok(())
    }

    /// Texels of the most recently presented back buffer, after draining the
    /// queue. `None` before the first frame.
    pub fn read_last_presented(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(target) = self.last_presented else {
            return Ok(None);
        };
        self.wait_idle()?;
        self.bridge
            .present_mut()
            .read_texture(target, ResourceState::Present)
            .map(Some)
    }

    fn wait_for_slot(&mut self, slot: &FrameSlot, stats: &mut FrameStatsAccumulator) -> Result<()> {
        let clock = stats.clock().clone();
        let present = self.bridge.present_mut();
        if present.completed_value(self.fence.fence())? >= slot.fence_value {
            return Ok(());
        }
        let started = clock.now();
        present.wait_for(self.fence.fence(), slot.fence_value)?;
        stats.record_fence_wait(clock.now().saturating_sub(started));
        Ok(())
    }

    fn record(&mut self, slot: &FrameSlot) -> Result<()> {
        let pair = *self.dispatcher.pair();
        let result = pair.result.texture;
        let present = self.bridge.present_mut();
        present.reset_context(slot.context)?;

        let mut commands = Vec::with_capacity(5);
        if pair.result_state != ResourceState::CopySource {
            commands.push(Command::Transition {
                texture: result,
                before: pair.result_state,
                after: ResourceState::CopySource,
            });
        }
        commands.push(Command::Transition {
            texture: slot.target,
            before: ResourceState::Present,
            after: ResourceState::CopyDest,
        });
        commands.push(Command::Copy {
            src: result,
            dst: slot.target,
        });
        commands.push(Command::Transition {
            texture: slot.target,
            before: ResourceState::CopyDest,
            after: ResourceState::Present,
        });
        if pair.result_state != ResourceState::CopySource {
            commands.push(Command::Transition {
                texture: result,
                before: ResourceState::CopySource,
                after: pair.result_state,
            });
        }

        for command in &commands {
            present.record(slot.context, command)?;
        }
        present.close_context(slot.context)
    }
}

impl<C: ComputeRuntime> Drop for FrameOrchestrator<C> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("Failed to drain frames before shutdown: {e}");
        }
        let fence = self.fence.fence();
        self.bridge.present_mut().destroy_fence(fence);
    }
}
