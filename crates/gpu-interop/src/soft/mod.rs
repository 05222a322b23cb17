//! Host-memory implementation of both runtimes.
//!
//! The software adapter behaves like a GPU with deferred execution: work
//! submitted to a queue is only retired when the host waits on a fence or
//! reads a texture back. Queues are serviced round-robin and honour
//! queue-side fence waits, so cross-queue ordering bugs show up as stalls or
//! stale data instead of silently working.
//!
//! A compute device layered on a presentation device keeps a private cache
//! per wrapped view, loaded on acquire and written back on release. Skipping
//! either call is therefore observable, as it would be on real hardware.

mod adapter;
mod compute;
mod memory;
mod present;

pub use adapter::{SoftAdapter, SoftAdapterConfig};
pub use compute::SoftComputeDevice;
pub use present::{SoftPresentDevice, SoftResource};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking kernel poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
