//! The device/queue provider contract.
//!
//! Everything the orchestration layer needs from a graphics device goes
//! through [`GpuDevice`]. [`crate::vulkan::VulkanDevice`] implements it on top
//! of `ash`; tests substitute an in-memory device with controllable fences.
//!
//! Handles passed back into a device must have been created by that same
//! device and must not have been destroyed.

use crate::error::Result;
use crate::shader::ShaderBytecode;
use crate::state::PipelineStateKey;
use ash::vk;
use std::ptr::NonNull;

/// Memory classification of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Host-visible and persistently mapped.
    HostVisible,
    /// Device-local, not mappable.
    DeviceLocal,
}

impl MemoryKind {
    /// Whether buffers of this kind expose a host pointer.
    pub fn is_mappable(self) -> bool {
        matches!(self, Self::HostVisible)
    }
}

/// Parameters for creating a buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryKind,
    pub name: &'a str,
}

/// Host address of a persistently mapped allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to device memory that stays mapped for the
// lifetime of the owning buffer; synchronisation of accesses is the owner's job.
unsafe impl Send for MappedPtr {}
// SAFETY: see above.
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Wrap a mapped address.
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Raw base address.
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// A buffer created by a [`GpuDevice`].
#[derive(Debug)]
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub memory: MemoryKind,
    pub usage: vk::BufferUsageFlags,
    pub mapped: Option<MappedPtr>,
}

/// Limits the orchestration layer has to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_uniform_offset_alignment: u64,
    pub min_storage_offset_alignment: u64,
    pub max_push_constants_size: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_offset_alignment: 256,
            min_storage_offset_alignment: 256,
            max_push_constants_size: 128,
        }
    }
}

/// One descriptor write into a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        binding: u32,
        ty: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl DescriptorWrite {
    /// Binding index this write targets.
    pub fn binding(&self) -> u32 {
        match self {
            Self::Buffer { binding, .. } | Self::Image { binding, .. } => *binding,
        }
    }
}

/// Pre-translated vertex input description.
#[derive(Debug, Clone, Default)]
pub struct VertexInputLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Everything needed to compile one graphics pipeline variant.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex: &'a ShaderBytecode,
    pub fragment: &'a ShaderBytecode,
    pub vertex_input: &'a VertexInputLayout,
    pub state: &'a PipelineStateKey,
}

/// Attachments a draw renders into (dynamic rendering).
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    pub color_view: vk::ImageView,
    pub depth_view: Option<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
}

/// Non-indexed draw parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawParams {
    /// A single instance of `vertex_count` vertices.
    pub fn vertices(vertex_count: u32) -> Self {
        Self {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}

/// Global memory dependency between two synchronization scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    fn shader_stages() -> vk::PipelineStageFlags2 {
        vk::PipelineStageFlags2::COMPUTE_SHADER
            | vk::PipelineStageFlags2::VERTEX_SHADER
            | vk::PipelineStageFlags2::FRAGMENT_SHADER
    }

    /// Shader writes of earlier work made visible to later work in the same
    /// command buffer.
    pub fn between_workloads() -> Self {
        Self {
            src_stages: Self::shader_stages(),
            src_access: vk::AccessFlags2::SHADER_WRITE,
            dst_stages: Self::shader_stages() | vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            dst_access: vk::AccessFlags2::SHADER_READ
                | vk::AccessFlags2::SHADER_WRITE
                | vk::AccessFlags2::UNIFORM_READ
                | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        }
    }

    /// Shader writes made visible to host reads once the fence signals.
    pub fn before_host_read() -> Self {
        Self {
            src_stages: Self::shader_stages(),
            src_access: vk::AccessFlags2::SHADER_WRITE,
            dst_stages: vk::PipelineStageFlags2::HOST,
            dst_access: vk::AccessFlags2::HOST_READ,
        }
    }
}

/// Device/queue provider used by every orchestration component.
pub trait GpuDevice: Send + Sync {
    /// Alignment and size limits.
    fn limits(&self) -> DeviceLimits;

    // Memory

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<DeviceBuffer>;
    fn destroy_buffer(&self, buffer: &DeviceBuffer) -> Result<()>;

    // Layouts

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constants: Option<vk::PushConstantRange>,
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    // Descriptors

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // Pipelines

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        shader: &ShaderBytecode,
    ) -> Result<vk::Pipeline>;
    fn create_graphics_pipeline(
        &self,
        layout: vk::PipelineLayout,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Synchronization

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Block until the fence signals. No timeout.
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()>;
    /// Non-blocking status query.
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    // Commands

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, cmd: vk::CommandBuffer);
    /// Reset and begin recording a one-time-submit command buffer.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    );
    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    );
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]);
    /// Begin dynamic rendering and set viewport/scissor to the target extent.
    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, target: &RenderTarget);
    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_vertex_buffers(&self, cmd: vk::CommandBuffer, buffers: &[vk::Buffer], offsets: &[u64]);
    fn cmd_draw(&self, cmd: vk::CommandBuffer, params: &DrawParams);
    /// Record a global memory barrier. Must not be called inside rendering.
    fn cmd_memory_barrier(&self, cmd: vk::CommandBuffer, barrier: &MemoryBarrier);

    /// Submit a recorded command buffer; `fence` signals on completion.
    fn submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
}
