//! [`GpuDevice`] on top of `ash` and `gpu-allocator`.
//!
//! The host creates the instance, device and queue; this type borrows them
//! for its lifetime. All recording and submission is expected to come from
//! one thread, matching the scheduler's model; the command pool and queue are
//! still guarded so misuse cannot race inside the driver.

use crate::device::{
    BufferDesc, DescriptorWrite, DeviceBuffer, DeviceLimits, DrawParams, GpuDevice,
    GraphicsPipelineDesc, MappedPtr, MemoryBarrier, MemoryKind, RenderTarget,
};
use crate::error::{GpuError, GpuObject, Result};
use crate::shader::ShaderBytecode;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Vulkan implementation of the device contract.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
    queue: Mutex<vk::Queue>,
    command_pool: Mutex<vk::CommandPool>,
    pipeline_cache: vk::PipelineCache,
    limits: DeviceLimits,
}

impl VulkanDevice {
    /// Wrap host-created handles.
    ///
    /// # Safety
    /// The instance, device and physical device must be valid, `queue` must
    /// belong to `queue_family`, and the device must outlive the returned value.
    /// The device must have `dynamicRendering` and `synchronization2` enabled.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        queue: vk::Queue,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let pipeline_cache = match unsafe {
            device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)
        } {
            Ok(cache) => cache,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(e.into());
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = DeviceLimits {
            min_uniform_offset_alignment: properties.limits.min_uniform_buffer_offset_alignment,
            min_storage_offset_alignment: properties.limits.min_storage_buffer_offset_alignment,
            max_push_constants_size: properties.limits.max_push_constants_size,
        };
        tracing::info!(?limits, queue_family, "Vulkan device wrapped");

        Ok(Self {
            device,
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            queue: Mutex::new(queue),
            command_pool: Mutex::new(command_pool),
            pipeline_cache,
            limits,
        })
    }

    /// The wrapped `ash` device.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn shader_module(&self, shader: &ShaderBytecode) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(shader.words());
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| GpuError::ShaderCompilation(format!("{:?}: {e}", shader.stage())))
    }

    fn free_allocation(&self, allocation: Allocation) -> Result<()> {
        self.allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }
}

impl GpuDevice for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<DeviceBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(GpuError::creation(GpuObject::Buffer))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = match desc.memory {
            MemoryKind::HostVisible => MemoryLocation::CpuToGpu,
            MemoryKind::DeviceLocal => MemoryLocation::GpuOnly,
        };

        let allocation = self
            .allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
            .and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name: desc.name,
                        requirements,
                        location,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| GpuError::AllocationFailed(format!("{}: {e}", desc.name)))
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation)?;
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(GpuError::creation(GpuObject::Buffer)(e));
        }

        let mapped = if desc.memory.is_mappable() {
            allocation
                .mapped_ptr()
                .map(|ptr| MappedPtr::new(ptr.cast::<u8>()))
        } else {
            None
        };
        self.allocations.lock().insert(buffer, allocation);

        Ok(DeviceBuffer {
            buffer,
            size: desc.size,
            memory: desc.memory,
            usage: desc.usage,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: &DeviceBuffer) -> Result<()> {
        let allocation = self.allocations.lock().remove(&buffer.buffer);
        if let Some(allocation) = allocation {
            self.free_allocation(allocation)?;
        }
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(GpuError::creation(GpuObject::DescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constants: Option<vk::PushConstantRange>,
    ) -> Result<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let ranges: Vec<vk::PushConstantRange> = push_constants.into_iter().collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);
        unsafe { self.device.create_pipeline_layout(&info, None) }
            .map_err(GpuError::creation(GpuObject::PipelineLayout))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(GpuError::creation(GpuObject::DescriptorPool))
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count as usize];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(GpuError::creation(GpuObject::DescriptorSet))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        enum Info {
            Buffer(vk::DescriptorType, vk::DescriptorBufferInfo),
            Image(vk::DescriptorType, vk::DescriptorImageInfo),
        }

        let infos: Vec<(u32, Info)> = writes
            .iter()
            .map(|write| match *write {
                DescriptorWrite::Buffer {
                    binding,
                    ty,
                    buffer,
                    offset,
                    range,
                } => (
                    binding,
                    Info::Buffer(
                        ty,
                        vk::DescriptorBufferInfo::default()
                            .buffer(buffer)
                            .offset(offset)
                            .range(range),
                    ),
                ),
                DescriptorWrite::Image {
                    binding,
                    ty,
                    view,
                    sampler,
                    layout,
                } => (
                    binding,
                    Info::Image(
                        ty,
                        vk::DescriptorImageInfo::default()
                            .image_view(view)
                            .sampler(sampler)
                            .image_layout(layout),
                    ),
                ),
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet<'_>> = infos
            .iter()
            .map(|(binding, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .dst_array_element(0);
                match info {
                    Info::Buffer(ty, buffer) => write
                        .descriptor_type(*ty)
                        .buffer_info(std::slice::from_ref(buffer)),
                    Info::Image(ty, image) => write
                        .descriptor_type(*ty)
                        .image_info(std::slice::from_ref(image)),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        shader: &ShaderBytecode,
    ) -> Result<vk::Pipeline> {
        let module = self.shader_module(shader)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let result = unsafe {
            self.device
                .create_compute_pipelines(self.pipeline_cache, &[info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };

        let pipelines = result.map_err(|(_, e)| GpuError::creation(GpuObject::Pipeline)(e))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".to_string()))
    }

    fn create_graphics_pipeline(
        &self,
        layout: vk::PipelineLayout,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<vk::Pipeline> {
        let key = desc.state;
        let vert_module = self.shader_module(desc.vertex)?;
        let frag_module = match self.shader_module(desc.fragment) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_input.bindings)
            .vertex_attribute_descriptions(&desc.vertex_input.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(key.topology())
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(key.polygon_mode())
            .cull_mode(key.cull_mode())
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(key.depth_test())
            .depth_write_enable(key.depth_write())
            .depth_compare_op(key.depth_compare())
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let mut blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(key.color_write_mask());
        if let Some(factors) = key.blend() {
            blend_attachment = blend_attachment
                .blend_enable(true)
                .src_color_blend_factor(factors.src_color)
                .dst_color_blend_factor(factors.dst_color)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(factors.src_alpha)
                .dst_alpha_blend_factor(factors.dst_alpha)
                .alpha_blend_op(vk::BlendOp::ADD);
        }
        let blend_attachments = [blend_attachment];

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(key.logic_op().is_some())
            .logic_op(key.logic_op().unwrap_or(vk::LogicOp::COPY))
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let targets = key.render_targets();
        let color_formats = [targets.color];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
        if let Some(depth_format) = targets.depth {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result = unsafe {
            self.device
                .create_graphics_pipelines(self.pipeline_cache, &[pipeline_info], None)
        };
        unsafe {
            self.device.destroy_shader_module(vert_module, None);
            self.device.destroy_shader_module(frag_module, None);
        }

        let pipelines = result.map_err(|(_, e)| GpuError::creation(GpuObject::Pipeline)(e))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".to_string()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&info, None) }.map_err(GpuError::creation(GpuObject::Fence))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX)? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(GpuError::creation(GpuObject::CommandBuffer))?;
        buffers.into_iter().next().ok_or(GpuError::ObjectCreation {
            object: GpuObject::CommandBuffer,
            source: vk::Result::ERROR_UNKNOWN,
        })
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let _pool = self.command_pool.lock();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cmd, bind_point, layout, 0, &[set], dynamic_offsets);
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        unsafe { self.device.cmd_push_constants(cmd, layout, stages, 0, data) };
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]) {
        unsafe { self.device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]) };
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, target: &RenderTarget) {
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(if target.clear_color.is_some() {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            })
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: target.clear_color.unwrap_or([0.0; 4]),
                },
            });

        let depth_attachment = target.depth_view.map(|view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(if target.clear_depth.is_some() {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                })
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: target.clear_depth.unwrap_or(1.0),
                        stencil: 0,
                    },
                })
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: target.extent,
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            self.device.cmd_begin_rendering(cmd, &rendering_info);
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[render_area]);
        }
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cmd) };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        unsafe { self.device.cmd_bind_vertex_buffers(cmd, 0, buffers, offsets) };
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, params: &DrawParams) {
        unsafe {
            self.device.cmd_draw(
                cmd,
                params.vertex_count,
                params.instance_count,
                params.first_vertex,
                params.first_instance,
            );
        }
    }

    fn cmd_memory_barrier(&self, cmd: vk::CommandBuffer, barrier: &MemoryBarrier) {
        let memory_barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(barrier.src_stages)
            .src_access_mask(barrier.src_access)
            .dst_stage_mask(barrier.dst_stages)
            .dst_access_mask(barrier.dst_access);
        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&memory_barrier));
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence)? };
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("Device wait failed during shutdown: {e}");
            }
        }

        let leaked: Vec<(vk::Buffer, Allocation)> = self.allocations.get_mut().drain().collect();
        if !leaked.is_empty() {
            tracing::warn!(count = leaked.len(), "Freeing buffers still alive at shutdown");
        }
        for (buffer, allocation) in leaked {
            if let Err(e) = self.free_allocation(allocation) {
                tracing::warn!("Failed to free buffer allocation: {e}");
            }
            unsafe { self.device.destroy_buffer(buffer, None) };
        }

        // Frees all remaining device memory; must happen before the host
        // destroys the device.
        self.allocator.get_mut().take();

        unsafe {
            self.device
                .destroy_pipeline_cache(self.pipeline_cache, None);
            self.device
                .destroy_command_pool(*self.command_pool.get_mut(), None);
        }
        tracing::info!("Vulkan device released");
    }
}
