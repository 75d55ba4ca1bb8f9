// Error types
//
// Public operations return anyhow::Result. Failures a caller has to tell
// apart are AnvilError values wrapped into the anyhow error, so they can be
// recovered with `err.downcast_ref::<AnvilError>()`.

use ash::vk;

use crate::backend::pipeline::PipelineId;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnvilError {
    /// A driver entrypoint returned something other than VK_SUCCESS.
    /// State touched by the failing call has been rolled back.
    #[error("driver call failed: {0}")]
    Driver(vk::Result),

    #[error("pipeline {0:?} is a proxy and has no driver handle")]
    ProxyPipeline(PipelineId),

    #[error("pipeline {0:?} is not known to this manager")]
    UnknownPipeline(PipelineId),

    #[error("cannot resolve base pipeline {parent:?} of pipeline {child:?}: {reason}")]
    DerivativeResolution {
        child: PipelineId,
        parent: PipelineId,
        reason: &'static str,
    },

    #[error("{feature} requested without {extension} enabled on the device")]
    UnsupportedFeature {
        feature: &'static str,
        extension: &'static str,
    },

    #[error("memory is already bound to this {0}")]
    MemoryAlreadyBound(&'static str),

    #[error("no memory is bound to this {0} and no subscriber provided any")]
    MemoryNotBound(&'static str),

    #[error("invalid sparse region: {0}")]
    InvalidSparseRegion(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<vk::Result> for AnvilError {
    fn from(result: vk::Result) -> Self {
        AnvilError::Driver(result)
    }
}

/// Returns the driver result code carried by `err`, if any.
pub fn driver_result(err: &anyhow::Error) -> Option<vk::Result> {
    match err.downcast_ref::<AnvilError>() {
        Some(AnvilError::Driver(result)) => Some(*result),
        _ => None,
    }
}
