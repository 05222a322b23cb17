//! Error taxonomy shared by the bridge, the dispatcher and the orchestrator.
//!
//! There is no retryable category: every interop failure leaves GPU state that
//! cannot be rolled back without a device reset, so callers are expected to
//! terminate with the diagnostic.

use std::fmt;

/// The interop step that was running when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteropStep {
    AdapterSelection,
    DeviceCreation,
    DeviceWrap,
    HandleExport,
    HandleImport,
    TextureAllocation,
    ShaderCompilation,
    CommandRecording,
    Submission,
    Present,
    FenceWait,
    Readback,
}

impl fmt::Display for InteropStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AdapterSelection => "adapter selection",
            Self::DeviceCreation => "device creation",
            Self::DeviceWrap => "device wrap",
            Self::HandleExport => "handle export",
            Self::HandleImport => "handle import",
            Self::TextureAllocation => "texture allocation",
            Self::ShaderCompilation => "shader compilation",
            Self::CommandRecording => "command recording",
            Self::Submission => "submission",
            Self::Present => "present",
            Self::FenceWait => "fence wait",
            Self::Readback => "readback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InteropError {
    /// No adapter meets the minimum feature level, or a required wrap/share
    /// mechanism, format or kernel representation is unsupported.
    #[error("{step}: capability missing: {reason}")]
    Capability { step: InteropStep, reason: String },

    /// Allocation, wrap, or shared-handle failure.
    #[error("{step}: resource creation failed: {reason}")]
    ResourceCreation { step: InteropStep, reason: String },

    /// Acquire without a matching release, or vice versa.
    #[error("synchronization misuse: {reason}")]
    SynchronizationMisuse { reason: String },

    /// Command recording, submission, present or fence-wait failure.
    #[error("{step}: submission failed: {reason}")]
    Submission { step: InteropStep, reason: String },
}

impl InteropError {
    pub fn capability(step: InteropStep, reason: impl Into<String>) -> Self {
        Self::Capability {
            step,
            reason: reason.into(),
        }
    }

    pub fn resource(step: InteropStep, reason: impl Into<String>) -> Self {
        Self::ResourceCreation {
            step,
            reason: reason.into(),
        }
    }

    pub fn misuse(reason: impl Into<String>) -> Self {
        Self::SynchronizationMisuse {
            reason: reason.into(),
        }
    }

    pub fn submission(step: InteropStep, reason: impl Into<String>) -> Self {
        Self::Submission {
            step,
            reason: reason.into(),
        }
    }

    /// The step that failed. `None` for synchronization misuse, which is a
    /// contract violation rather than a failed step.
    pub fn step(&self) -> Option<InteropStep> {
        match self {
            Self::Capability { step, .. }
            | Self::ResourceCreation { step, .. }
            | Self::Submission { step, .. } => Some(*step),
            Self::SynchronizationMisuse { .. } => None,
        }
    }
}

pub type Result<T, E = InteropError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_names_the_failed_step() {
        let err = InteropError::resource(InteropStep::HandleImport, "size mismatch");
        assert_eq!(
            err.to_string(),
            "handle import: resource creation failed: size mismatch"
        );
        assert_eq!(err.step(), Some(InteropStep::HandleImport));
    }

    #[test]
    fn misuse_has_no_step() {
        let err = InteropError::misuse("release without acquire");
        assert!(err.step().is_none());
        assert!(err.to_string().contains("release without acquire"));
    }
}
