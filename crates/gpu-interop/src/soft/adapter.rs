use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use interop_core::{
    launch_grid, InteropError, InteropStep, Kernel, ManualClock, Result, TextureDesc, TexelView,
};
use tracing::{debug, warn};

use super::lock;
use super::memory::{resolve, Binding, MemoryBlock, WrappedView};
use crate::runtime::{AdapterInfo, ResourceState, SharedAccess, SharedHandle};

/// Software adapter settings.
#[derive(Debug, Clone)]
pub struct SoftAdapterConfig {
    pub name: String,
    pub max_texture_dimension: u32,
    /// Host threads a kernel launch is spread over.
    pub parallelism: usize,
    /// Clock advanced by `work_cost` for every retired work item, to simulate
    /// GPU execution time.
    pub clock: Option<Arc<ManualClock>>,
    pub work_cost: Duration,
}

impl Default for SoftAdapterConfig {
    fn default() -> Self {
        Self {
            name: "Soft Interop Adapter".to_string(),
            max_texture_dimension: 16384,
            parallelism: std::thread::available_parallelism().map_or(1, |n| n.get()),
            clock: None,
            work_cost: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct QueueId(usize);

/// One unit of queued GPU work.
pub(crate) enum Work {
    Copy {
        src: Weak<MemoryBlock>,
        dst: Weak<MemoryBlock>,
    },
    Transition {
        texture: Weak<MemoryBlock>,
        before: ResourceState,
        after: ResourceState,
    },
    Acquire(Arc<WrappedView>),
    Release(Arc<WrappedView>),
    Dispatch {
        kernel: Arc<dyn Kernel>,
        source: Binding,
        result: Binding,
    },
    Signal {
        fence: u64,
        value: u64,
    },
    Wait {
        fence: u64,
        value: u64,
    },
    Present {
        target: Weak<MemoryBlock>,
        presented: Arc<AtomicU64>,
    },
    /// End of a command list; clears the context's in-flight flag.
    Complete(Arc<AtomicBool>),
}

#[derive(Debug, Clone)]
pub(crate) enum SharedObject {
    Texture {
        block: Weak<MemoryBlock>,
        desc: TextureDesc,
        access: SharedAccess,
    },
    Fence(u64),
}

struct FenceState {
    value: u64,
    refs: u32,
}

#[derive(Default)]
struct Scheduler {
    queues: Vec<VecDeque<Work>>,
    fences: HashMap<u64, FenceState>,
    shared: HashMap<u64, SharedObject>,
}

struct AdapterShared {
    info: AdapterInfo,
    config: SoftAdapterConfig,
    scheduler: Mutex<Scheduler>,
    next_id: AtomicU64,
}

/// A software GPU shared by every device created on it.
#[derive(Clone)]
pub struct SoftAdapter {
    shared: Arc<AdapterShared>,
}

impl SoftAdapter {
    pub fn new(config: SoftAdapterConfig) -> Self {
        let info = AdapterInfo {
            name: config.name.clone(),
            vendor_id: 0,
            device_id: 0,
            software: true,
            max_texture_dimension: config.max_texture_dimension,
        };
        debug!(
            "Software adapter '{}' ({} kernel threads)",
            info.name, config.parallelism
        );
        Self {
            shared: Arc::new(AdapterShared {
                info,
                config,
                scheduler: Mutex::new(Scheduler::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.shared.info
    }

    pub fn config(&self) -> &SoftAdapterConfig {
        &self.shared.config
    }

    /// Work items submitted but not yet retired, across all queues.
    pub fn pending_work(&self) -> usize {
        lock(&self.shared.scheduler)
            .queues
            .iter()
            .map(VecDeque::len)
            .sum()
    }

    /// Retire all submitted work.
    pub fn drain(&self) -> Result<()> {
        let mut scheduler = lock(&self.shared.scheduler);
        self.run_until(&mut scheduler, |s| s.queues.iter().all(VecDeque::is_empty))
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn create_queue(&self) -> QueueId {
        let mut scheduler = lock(&self.shared.scheduler);
        scheduler.queues.push(VecDeque::new());
        QueueId(scheduler.queues.len() - 1)
    }

    pub(crate) fn submit(&self, queue: QueueId, work: impl IntoIterator<Item = Work>) {
        lock(&self.shared.scheduler).queues[queue.0].extend(work);
    }

    pub(crate) fn create_fence(&self, initial: u64) -> u64 {
        let id = self.next_id();
        lock(&self.shared.scheduler).fences.insert(
            id,
            FenceState {
                value: initial,
                refs: 1,
            },
        );
        id
    }

    pub(crate) fn retain_fence(&self, fence: u64) -> bool {
        match lock(&self.shared.scheduler).fences.get_mut(&fence) {
            Some(state) => {
                state.refs += 1;
                true
            }
            None => false,
        }
    }

    pub(crate) fn release_fence(&self, fence: u64) {
        let mut scheduler = lock(&self.shared.scheduler);
        if let Some(state) = scheduler.fences.get_mut(&fence) {
            state.refs -= 1;
            if state.refs == 0 {
                scheduler.fences.remove(&fence);
            }
        }
    }

    pub(crate) fn fence_value(&self, fence: u64) -> Option<u64> {
        lock(&self.shared.scheduler)
            .fences
            .get(&fence)
            .map(|state| state.value)
    }

    /// Retire work until `fence` reaches `value`.
    pub(crate) fn wait_until(&self, fence: u64, value: u64) -> Result<()> {
        let mut scheduler = lock(&self.shared.scheduler);
        if !scheduler.fences.contains_key(&fence) {
            return Err(InteropError::submission(
                InteropStep::FenceWait,
                format!("waiting on unknown fence {fence}"),
            ));
        }
        self.run_until(&mut scheduler, |s| {
            s.fences.get(&fence).is_some_and(|f| f.value >= value)
        })
    }

    pub(crate) fn share(&self, object: SharedObject) -> SharedHandle {
        let handle = self.next_id();
        lock(&self.shared.scheduler).shared.insert(handle, object);
        SharedHandle(handle)
    }

    pub(crate) fn shared_object(&self, handle: SharedHandle) -> Option<SharedObject> {
        lock(&self.shared.scheduler).shared.get(&handle.0).cloned()
    }

    pub(crate) fn close_shared(&self, handle: SharedHandle) {
        lock(&self.shared.scheduler).shared.remove(&handle.0);
    }

    // -- Scheduler ------------------------------------------------------------

    fn run_until(
        &self,
        scheduler: &mut Scheduler,
        done: impl Fn(&Scheduler) -> bool,
    ) -> Result<()> {
        loop {
            if done(scheduler) {
                return Ok(());
            }
            let mut progressed = false;
            for queue in 0..scheduler.queues.len() {
                let ready = match scheduler.queues[queue].front() {
                    None => false,
                    Some(Work::Wait { fence, value }) => scheduler
                        .fences
                        .get(fence)
                        .is_some_and(|f| f.value >= *value),
                    Some(_) => true,
                };
                if !ready {
                    continue;
                }
                if let Some(work) = scheduler.queues[queue].pop_front() {
                    self.execute(scheduler, work)?;
                    progressed = true;
                }
            }
            if !progressed {
                return Err(InteropError::submission(
                    InteropStep::FenceWait,
                    "no queue can make progress; every queue is waiting on a fence nothing will signal",
                ));
            }
        }
    }

    fn execute(&self, scheduler: &mut Scheduler, work: Work) -> Result<()> {
        match work {
            Work::Copy { src, dst } => {
                let src = resolve(&src, "copy source")?;
                let dst = resolve(&dst, "copy destination")?;
                if Arc::ptr_eq(&src, &dst) {
                    return Err(fault("copy source and destination are the same texture"));
                }
                if !src.desc.same_layout(&dst.desc) {
                    return Err(fault(format!(
                        "copy between mismatched layouts {:?} and {:?}",
                        src.desc, dst.desc
                    )));
                }
                let from = lock(&src.contents);
                let mut to = lock(&dst.contents);
                expect_state(from.state, ResourceState::CopySource, "copy source")?;
                expect_state(to.state, ResourceState::CopyDest, "copy destination")?;
                to.bytes.copy_from_slice(&from.bytes);
            }
            Work::Transition {
                texture,
                before,
                after,
            } => {
                let block = resolve(&texture, "barrier target")?;
                let mut contents = lock(&block.contents);
                expect_state(contents.state, before, "barrier target")?;
                contents.state = after;
            }
            Work::Acquire(view) => {
                let block = resolve(&view.block, "wrapped resource")?;
                let contents = lock(&block.contents);
                expect_state(contents.state, view.in_state, "acquired resource")?;
                lock(&view.cache).copy_from_slice(&contents.bytes);
            }
            Work::Release(view) => {
                let block = resolve(&view.block, "wrapped resource")?;
                let mut contents = lock(&block.contents);
                contents.bytes.copy_from_slice(&lock(&view.cache));
                contents.state = view.out_state;
            }
            Work::Dispatch {
                kernel,
                source,
                result,
            } => {
                let source_desc = source.desc();
                let result_desc = result.desc();
                let source_bytes = source.read()?;
                let view = TexelView::new(&source_bytes, source_desc.extent(), source_desc.format)
                    .ok_or_else(|| fault("kernel source storage does not match its view"))?;
                let parallelism = self.shared.config.parallelism;
                result.write(|bytes| {
                    launch_grid(
                        kernel.as_ref(),
                        &view,
                        bytes,
                        result_desc.extent(),
                        result_desc.format,
                        parallelism,
                    )
                })?;
            }
            Work::Signal { fence, value } => match scheduler.fences.get_mut(&fence) {
                Some(state) => state.value = value,
                None => warn!("Signal of destroyed fence {fence} dropped"),
            },
            Work::Wait { .. } => {}
            Work::Present { target, presented } => {
                let block = resolve(&target, "back buffer")?;
                expect_state(lock(&block.contents).state, ResourceState::Present, "back buffer")?;
                presented.fetch_add(1, Ordering::SeqCst);
            }
            Work::Complete(in_flight) => in_flight.store(false, Ordering::SeqCst),
        }

        if let Some(clock) = &self.shared.config.clock {
            clock.advance(self.shared.config.work_cost);
        }
        Ok(())
    }
}

fn fault(reason: impl std::fmt::Display) -> InteropError {
    InteropError::submission(InteropStep::Submission, format!("device fault: {reason}"))
}

fn expect_state(actual: ResourceState, expected: ResourceState, what: &str) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(fault(format!(
            "{what} is in state {actual:?}, the work expects {expected:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_wait_orders_work_across_queues() {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let a = adapter.create_queue();
        let b = adapter.create_queue();
        let fence = adapter.create_fence(0);
        let done = adapter.create_fence(0);

        // Queue A cannot finish before queue B signals.
        adapter.submit(
            a,
            [
                Work::Wait { fence, value: 1 },
                Work::Signal {
                    fence: done,
                    value: 7,
                },
            ],
        );
        adapter.submit(b, [Work::Signal { fence, value: 1 }]);

        adapter.wait_until(done, 7).unwrap();
        assert_eq!(adapter.fence_value(fence), Some(1));
        assert_eq!(adapter.pending_work(), 0);
    }

    #[test]
    fn unsatisfiable_wait_is_reported_as_stall() {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let queue = adapter.create_queue();
        let fence = adapter.create_fence(0);
        adapter.submit(queue, [Work::Wait { fence, value: 5 }]);
        let err = adapter.drain().unwrap_err();
        assert_eq!(err.step(), Some(InteropStep::FenceWait));
    }

    #[test]
    fn work_is_deferred_until_the_host_waits() {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let queue = adapter.create_queue();
        let fence = adapter.create_fence(0);
        adapter.submit(queue, [Work::Signal { fence, value: 1 }]);
        assert_eq!(adapter.fence_value(fence), Some(0));
        adapter.wait_until(fence, 1).unwrap();
        assert_eq!(adapter.fence_value(fence), Some(1));
    }

    #[test]
    fn retired_work_advances_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let adapter = SoftAdapter::new(SoftAdapterConfig {
            clock: Some(clock.clone()),
            work_cost: Duration::from_millis(2),
            ..SoftAdapterConfig::default()
        });
        let queue = adapter.create_queue();
        let fence = adapter.create_fence(0);
        adapter.submit(
            queue,
            [
                Work::Signal { fence, value: 1 },
                Work::Signal { fence, value: 2 },
            ],
        );
        adapter.drain().unwrap();
        assert_eq!(interop_core::Clock::now(clock.as_ref()), Duration::from_millis(4));
    }

    #[test]
    fn fence_lives_until_last_reference_released() {
        let adapter = SoftAdapter::new(SoftAdapterConfig::default());
        let fence = adapter.create_fence(3);
        assert!(adapter.retain_fence(fence));
        adapter.release_fence(fence);
        assert_eq!(adapter.fence_value(fence), Some(3));
        adapter.release_fence(fence);
        assert_eq!(adapter.fence_value(fence), None);
    }
}
