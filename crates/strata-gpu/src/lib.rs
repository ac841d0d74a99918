//! GPU resource and frame orchestration for Strata.
//!
//! This crate provides:
//! - Growable linear buffers with deferred reclamation
//! - Descriptor binding declarations and per-frame descriptor set pools
//! - Compute and graphics pipeline caches keyed by render state
//! - An N-deep frame scheduler with fence backpressure
//! - A `GpuDevice` contract with a Vulkan implementation

pub mod binding;
pub mod buffer;
pub mod config;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod images;
pub mod pipeline;
pub mod registry;
pub mod retire;
pub mod scheduler;
pub mod shader;
pub mod state;
pub mod vulkan;

pub use binding::{
    BindingLayout, BufferBinding, BufferKind, DescriptorBinding, ImageBinding, PushConstantBlock,
};
pub use buffer::{align_up, BufferAllocator};
pub use config::OrchestratorConfig;
pub use context::{RenderContext, ResourceId};
pub use descriptors::{BoundSet, DescriptorSetPool};
pub use device::{
    BufferDesc, DescriptorWrite, DeviceBuffer, DeviceLimits, DrawParams, GpuDevice,
    GraphicsPipelineDesc, MappedPtr, MemoryBarrier, MemoryKind, RenderTarget, VertexInputLayout,
};
pub use error::{GpuError, GpuObject, Result};
pub use images::{ImageDescriptorInfo, ImageIdentity, ImageRegistry, ImageSlot, NoImages};
pub use pipeline::{
    ComputePipeline, ComputePipelineBuilder, GraphicsPipeline, GraphicsPipelineBuilder, PoolStats,
};
pub use registry::PipelineRegistry;
pub use retire::{Retired, RetirementQueue};
pub use scheduler::{BufferSource, Frame, FrameScheduler, SlotState, Submission, Work, Workload};
pub use shader::{
    BytecodeProvider, ShaderBytecode, ShaderLibrary, ShaderStage, ShaderStages, SPIRV_MAGIC,
};
pub use state::{BlendFactors, PipelineStateKey, RenderTargetFormats};
pub use vulkan::VulkanDevice;

pub use ash::vk;
