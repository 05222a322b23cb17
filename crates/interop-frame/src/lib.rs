//! Frame orchestration on top of the interop bridge.
//!
//! [`Dispatcher`] runs a kernel over a [`RuntimeAliasPair`] with the
//! synchronization its sharing strategy needs. [`FrameOrchestrator`] drives
//! the steady-state loop: wait for the frame slot, record the copy of the
//! result into the back buffer, dispatch, submit, present. [`InteropApp`]
//! wraps it all in the application lifecycle.
//!
//! [`RuntimeAliasPair`]: gpu_interop::RuntimeAliasPair

pub mod app;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod orchestrator;
pub mod slot;
pub mod stats;

pub use app::{InteropApp, Key};
pub use config::InteropConfig;
pub use dispatch::Dispatcher;
pub use orchestrator::FrameOrchestrator;
pub use slot::{FrameSlot, SlotState};
pub use stats::FrameStatsAccumulator;
