//! Cross-runtime synchronization.
//!
//! Same-device pairs hand ownership back and forth with acquire/release,
//! bracketed by [`AcquireScope`]. Cross-device pairs cannot use
//! acquire/release, so the two queues are ordered through one shared fence
//! with [`FenceHandoff`].

use tracing::warn;

use interop_core::Result;

use crate::runtime::{ComputeRuntime, FenceId, PresentRuntime, SharedHandle, ViewId};

/// Wrapped views held by the compute runtime for the lifetime of the scope.
///
/// Dropping the scope without calling [`AcquireScope::release`] still releases
/// the views, so a failed dispatch cannot leave them owned by the compute
/// runtime.
pub struct AcquireScope<'a, C: ComputeRuntime> {
    compute: &'a mut C,
    views: Vec<ViewId>,
    released: bool,
}

impl<'a, C: ComputeRuntime> AcquireScope<'a, C> {
    pub fn begin(compute: &'a mut C, views: &[ViewId]) -> Result<Self> {
        compute.acquire(views)?;
        Ok(Self {
            compute,
            views: views.to_vec(),
            released: false,
        })
    }

    /// The compute runtime, for recording work against the acquired views.
    pub fn compute(&mut self) -> &mut C {
        self.compute
    }

    pub fn views(&self) -> &[ViewId] {
        &self.views
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.compute.release(&self.views)
    }
}

impl<C: ComputeRuntime> Drop for AcquireScope<'_, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "Releasing {} wrapped view(s) from an abandoned acquire scope",
            self.views.len()
        );
        if let Err(e) = self.compute.release(&self.views) {
            warn!("Release from abandoned scope failed: {e}");
        }
    }
}

/// Monotonically increasing values for one fence.
#[derive(Debug, Clone, Copy)]
pub struct FenceCounter {
    fence: FenceId,
    last: u64,
}

impl FenceCounter {
    pub fn new(fence: FenceId, initial: u64) -> Self {
        Self {
            fence,
            last: initial,
        }
    }

    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Reserve the next value to signal.
    pub fn next_value(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn last_value(&self) -> u64 {
        self.last
    }
}

/// One fence shared between both runtimes, as seen from each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffFence {
    pub present: FenceId,
    pub compute: FenceId,
    pub handle: SharedHandle,
}

/// Orders compute and presentation work on cross-device shared textures.
///
/// Each frame the compute queue waits for the last "surfaces free" value the
/// presentation queue signalled, runs the dispatch and signals a "result
/// ready" value. The presentation queue waits for that value before the copy
/// that reads the result, then signals the next "surfaces free" value.
#[derive(Debug)]
pub struct FenceHandoff {
    fence: HandoffFence,
    counter: u64,
    free: u64,
    ready: Option<u64>,
}

impl FenceHandoff {
    pub fn new(fence: HandoffFence) -> Self {
        Self {
            fence,
            counter: 0,
            free: 0,
            ready: None,
        }
    }

    pub fn fence(&self) -> HandoffFence {
        self.fence
    }

    /// Value the compute queue last signalled, if a dispatch is outstanding.
    pub fn ready_value(&self) -> Option<u64> {
        self.ready
    }

    pub fn before_dispatch<C: ComputeRuntime>(&mut self, compute: &mut C) -> Result<()> {
        compute.queue_wait(self.fence.compute, self.free)
    }

    pub fn after_dispatch<C: ComputeRuntime>(&mut self, compute: &mut C) -> Result<()> {
        self.counter += 1;
        compute.signal(self.fence.compute, self.counter)?;
        self.ready = Some(self.counter);
        Ok(())
    }

    /// Queue a wait for the outstanding dispatch. Does nothing if there is
    /// none.
    pub fn before_read<P: PresentRuntime>(&mut self, present: &mut P) -> Result<()> {
        match self.ready {
            Some(value) => present.queue_wait(self.fence.present, value),
            None => Ok(()),
        }
    }

    pub fn after_read<P: PresentRuntime>(&mut self, present: &mut P) -> Result<()> {
        self.counter += 1;
        present.signal(self.fence.present, self.counter)?;
        self.free = self.counter;
        self.ready = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ResourceState, TextureId};
    use crate::soft::{SoftAdapter, SoftAdapterConfig, SoftComputeDevice, SoftPresentDevice};
    use interop_core::{SharingMode, TextureDesc, TextureFormat, UsageFlags};

    fn wrapped_view() -> (SoftPresentDevice, SoftComputeDevice, ViewId) {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let mut present = SoftPresentDevice::new(&adapter);
        let mut compute = SoftComputeDevice::layered(&present);
        let desc = TextureDesc::new(1, 1, TextureFormat::Rgba8Unorm)
            .with_usage(UsageFlags::SHADER_READ)
            .with_sharing(SharingMode::Aliased);
        let texture: TextureId = present
            .create_texture(&desc, None, ResourceState::NonPixelShaderResource)
            .unwrap();
        let view = compute
            .wrap(
                &present.resource(texture).unwrap(),
                &desc,
                UsageFlags::SHADER_READ,
                ResourceState::NonPixelShaderResource,
                ResourceState::NonPixelShaderResource,
            )
            .unwrap();
        (present, compute, view)
    }

    #[test]
    fn scope_release_balances_acquire() {
        let (_present, mut compute, view) = wrapped_view();
        let scope = AcquireScope::begin(&mut compute, &[view]).unwrap();
        assert_eq!(scope.views(), &[view]);
        scope.release().unwrap();
        assert_eq!(compute.acquired_views(), 0);
    }

    #[test]
    fn abandoned_scope_still_releases() {
        let (_present, mut compute, view) = wrapped_view();
        {
            let _scope = AcquireScope::begin(&mut compute, &[view]).unwrap();
        }
        assert_eq!(compute.acquired_views(), 0);
        // A second cycle is legal again.
        AcquireScope::begin(&mut compute, &[view])
            .unwrap()
            .release()
            .unwrap();
    }

    #[test]
    fn fence_counter_is_monotonic() {
        let mut counter = FenceCounter::new(FenceId::from_raw(1), 4);
        assert_eq!(counter.next_value(), 5);
        assert_eq!(counter.next_value(), 6);
        assert_eq!(counter.last_value(), 6);
    }

    #[test]
    fn handoff_orders_the_two_queues() {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let mut present = SoftPresentDevice::new(&adapter);
        let mut compute = SoftComputeDevice::native(&adapter);
        let fence = present.create_fence(0, true).unwrap();
        let handle = present.export_fence(fence).unwrap();
        let opened = compute.open_fence(handle).unwrap();
        let mut handoff = FenceHandoff::new(HandoffFence {
            present: fence,
            compute: opened,
            handle,
        });

        // Presentation work queued first must still wait for the compute side.
        handoff.before_dispatch(&mut compute).unwrap();
        handoff.after_dispatch(&mut compute).unwrap();
        assert_eq!(handoff.ready_value(), Some(1));
        handoff.before_read(&mut present).unwrap();
        handoff.after_read(&mut present).unwrap();
        assert_eq!(handoff.ready_value(), None);

        // Nothing is flushed on the compute side yet: the presentation queue
        // cannot get past its wait.
        assert!(present.wait_for(fence, 2).is_err());

        compute.flush().unwrap();
        present.wait_for(fence, 2).unwrap();
        assert_eq!(present.completed_value(fence).unwrap(), 2);
    }
}
