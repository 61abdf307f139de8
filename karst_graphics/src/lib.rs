//! Vulkan render-graph runtime.
//!
//! A [`renderer::Renderer`] owns a set of indexed attachments (images or
//! window swapchains), a DAG of render/compute passes consuming them, and a
//! ring of virtual frames that are acquired, recorded and submitted in turn.
//! Image layouts, load/store ops, framebuffers and inter-pass barriers are
//! derived from the consumption declarations; cross-queue synchronization is
//! expressed through [`deps::Dependency`] objects.

use thiserror::Error;

pub(crate) mod backing;
pub mod cache;
pub mod deps;
pub mod frame;
pub mod graph;
pub mod hash;
pub mod pool;
pub mod renderer;
pub mod types;
pub mod vulkan;

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use raw_window_handle;

/// Failure kinds surfaced on the public API.
///
/// Creation failures inside the caches log and surface as `CacheCreate`; the
/// caller decides whether the missing object is fatal. `Skip` is not an
/// error, it marks a transiently unrecordable pass (e.g. a minimized
/// window).
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("allocation failed")]
    OutOfMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("queue submission failed: {0}")]
    QueueSubmitFailed(vk::Result),

    #[error("could not create cached Vulkan object: {0}")]
    CacheCreate(vk::Result),

    #[error("pipeline cache data is invalid or incompatible")]
    Incompatible,

    #[error("invalid graph mutation: {0}")]
    GraphInvalid(&'static str),

    #[error("pass skipped: {0}")]
    Skip(&'static str),

    #[error(transparent)]
    Vk(#[from] vk::Result),
}

impl RenderError {
    /// Folds a raw Vulkan error into its distinguishable kind.
    pub(crate) fn from_vk(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory
            }
            other => Self::Vk(other),
        }
    }

    /// Classifies a failed queue submission: device loss is its own
    /// non-recoverable kind, everything else is a submit failure.
    pub(crate) fn from_submit(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::QueueSubmitFailed(other),
        }
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_errors_fold_into_their_kinds() {
        assert!(matches!(
            RenderError::from_vk(vk::Result::ERROR_DEVICE_LOST),
            RenderError::DeviceLost
        ));
        assert!(matches!(
            RenderError::from_vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderError::OutOfMemory
        ));
        assert!(matches!(
            RenderError::from_vk(vk::Result::ERROR_UNKNOWN),
            RenderError::Vk(vk::Result::ERROR_UNKNOWN)
        ));
    }

    #[test]
    fn failed_submission_classifies_device_loss() {
        assert!(matches!(
            RenderError::from_submit(vk::Result::ERROR_DEVICE_LOST),
            RenderError::DeviceLost
        ));
        assert!(matches!(
            RenderError::from_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RenderError::QueueSubmitFailed(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }
}
