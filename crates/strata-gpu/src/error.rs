//! GPU error types.

use ash::vk;
use std::fmt;
use thiserror::Error;

/// Kind of device object, used to attribute creation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuObject {
    Buffer,
    DescriptorSetLayout,
    PipelineLayout,
    DescriptorPool,
    DescriptorSet,
    Pipeline,
    Fence,
    CommandBuffer,
}

impl fmt::Display for GpuObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Buffer => "buffer",
            Self::DescriptorSetLayout => "descriptor set layout",
            Self::PipelineLayout => "pipeline layout",
            Self::DescriptorPool => "descriptor pool",
            Self::DescriptorSet => "descriptor set",
            Self::Pipeline => "pipeline",
            Self::Fence => "fence",
            Self::CommandBuffer => "command buffer",
        };
        f.write_str(name)
    }
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error outside of object creation (submission, waits, recording).
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Creating a device object failed.
    #[error("Failed to create {object}: {source}")]
    ObjectCreation {
        object: GpuObject,
        #[source]
        source: vk::Result,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Shader bytecode was rejected.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A write did not fit the remaining buffer capacity.
    #[error("Buffer capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded { requested: u64, available: u64 },

    /// A frame slot was asked to record while it is already recording.
    #[error("Frame slot {slot} is still recording")]
    SlotBusy { slot: usize },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Attach the object kind to a raw Vulkan creation failure.
    pub fn creation(object: GpuObject) -> impl FnOnce(vk::Result) -> Self {
        move |source| Self::ObjectCreation { object, source }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_error_names_object() {
        let err = GpuError::creation(GpuObject::DescriptorPool)(
            vk::Result::ERROR_OUT_OF_POOL_MEMORY,
        );
        let message = err.to_string();
        assert!(message.starts_with("Failed to create descriptor pool"));
    }

    #[test]
    fn capacity_error_reports_sizes() {
        let err = GpuError::CapacityExceeded {
            requested: 8,
            available: 4,
        };
        assert_eq!(
            err.to_string(),
            "Buffer capacity exceeded: 8 bytes requested, 4 available"
        );
    }
}
