//! Kernel dispatch across the runtime boundary.

use std::sync::Arc;

use gpu_interop::{
    AcquireScope, ComputeRuntime, FenceHandoff, PresentRuntime, RuntimeAliasPair, SharingStrategy,
};
use interop_core::{InteropError, InteropStep, Kernel, Result};
use tracing::debug;

/// Runs one kernel over a [`RuntimeAliasPair`], synchronized for the pair's
/// strategy.
///
/// Same-device pairs are bracketed by acquire/release. Cross-device pairs go
/// through a [`FenceHandoff`], which also requires the presentation side to
/// call [`Dispatcher::before_read`] and [`Dispatcher::after_read`] around the
/// work that reads the result.
pub struct Dispatcher {
    kernel: Arc<dyn Kernel>,
    pair: RuntimeAliasPair,
    handoff: Option<FenceHandoff>,
}

impl Dispatcher {
    pub fn new(kernel: Arc<dyn Kernel>, pair: &RuntimeAliasPair) -> Result<Self> {
        let handoff = match pair.strategy {
            SharingStrategy::SameDevice => None,
            SharingStrategy::CrossDevice => {
                let fence = pair.handoff.ok_or_else(|| {
                    InteropError::capability(
                        InteropStep::HandleImport,
                        "cross-device pair has no shared fence",
                    )
                })?;
                Some(FenceHandoff::new(fence))
            }
        };
        debug!(
            "Dispatching '{}' over a {} pair",
            kernel.name(),
            pair.strategy.name()
        );
        Ok(Self {
            kernel,
            pair: *pair,
            handoff,
        })
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn pair(&self) -> &RuntimeAliasPair {
        &self.pair
    }

    /// Launch the kernel once over the result grid and submit it.
    pub fn dispatch<C: ComputeRuntime>(&mut self, compute: &mut C) -> Result<()> {
        let source = self.pair.source.view;
        let result = self.pair.result.view;
        match &mut self.handoff {
            None => {
                let mut scope = AcquireScope::begin(compute, &[source, result])?;
                scope.compute().dispatch(&self.kernel, source, result)?;
                scope.release()?;
            }
            Some(handoff) => {
                handoff.before_dispatch(compute)?;
                compute.dispatch(&self.kernel, source, result)?;
                handoff.after_dispatch(compute)?;
            }
        }
        compute.flush()
    }

    /// Order presentation work that reads the result after the last
    /// dispatch. Queue-side only; the host does not block.
    pub fn before_read<P: PresentRuntime>(&mut self, present: &mut P) -> Result<()> {
        match &mut self.handoff {
            Some(handoff) => handoff.before_read(present),
            None => Ok(()),
        }
    }

    /// Hand the shared surfaces back to the compute queue once the reads
    /// queued so far complete.
    pub fn after_read<P: PresentRuntime>(&mut self, present: &mut P) -> Result<()> {
        match &mut self.handoff {
            Some(handoff) => handoff.after_read(present),
            None => Ok(()),
        }
    }
}
