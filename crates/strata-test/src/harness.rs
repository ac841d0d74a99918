//! Rig construction and fixtures.

use crate::mock::{FenceMode, Kernel, MockDevice};
use crate::{Result, TestError};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_gpu::{
    BufferAllocator, ComputePipeline, DescriptorBinding, FrameScheduler, ImageDescriptorInfo,
    ImageRegistry, ImageSlot, MemoryKind, OrchestratorConfig, RenderContext, ResourceId,
    ShaderBytecode, ShaderStage, SPIRV_MAGIC,
};

/// Compute bytecode whose second word selects the mock kernel.
pub fn compute_shader(kernel: u32) -> ShaderBytecode {
    bytecode(ShaderStage::Compute, kernel)
}

pub fn vertex_shader() -> ShaderBytecode {
    bytecode(ShaderStage::Vertex, 0)
}

pub fn fragment_shader() -> ShaderBytecode {
    bytecode(ShaderStage::Fragment, 0)
}

fn bytecode(stage: ShaderStage, id: u32) -> ShaderBytecode {
    match ShaderBytecode::from_words(stage, vec![SPIRV_MAGIC, id]) {
        Ok(code) => code,
        Err(e) => unreachable!("fixture bytecode carries the magic number: {e}"),
    }
}

/// A mock device and a context over it.
pub struct TestRig {
    pub device: Arc<MockDevice>,
    pub ctx: Arc<RenderContext>,
}

impl TestRig {
    pub fn new(mode: FenceMode, config: OrchestratorConfig) -> Self {
        crate::init_tracing();
        let device = Arc::new(MockDevice::new(mode));
        let ctx = RenderContext::new(Arc::clone(&device) as Arc<dyn strata_gpu::GpuDevice>, config);
        Self { device, ctx }
    }

    /// Auto-signalling device with the default configuration.
    pub fn auto() -> Self {
        Self::new(FenceMode::AutoSignal, OrchestratorConfig::default())
    }

    /// Manually signalled device with `frames` slots.
    pub fn manual(frames: usize) -> Self {
        Self::new(FenceMode::Manual, OrchestratorConfig::new(frames))
    }

    pub fn scheduler(&self) -> Result<FrameScheduler> {
        Ok(FrameScheduler::new(Arc::clone(&self.ctx))?)
    }

    pub fn buffer(&self, name: &str, memory: MemoryKind, capacity: u64) -> Result<BufferAllocator> {
        Ok(BufferAllocator::new(
            Arc::clone(&self.ctx),
            name,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory,
            capacity,
        )?)
    }

    /// Compute pipeline running `kernel` over `bindings`.
    pub fn compute(
        &self,
        name: &str,
        kernel_id: u32,
        kernel: Kernel,
        bindings: impl IntoIterator<Item = DescriptorBinding>,
    ) -> Result<ComputePipeline> {
        self.device.register_kernel(kernel_id, kernel);
        Ok(ComputePipeline::builder(name)
            .bindings(bindings)
            .shader(compute_shader(kernel_id))
            .build(&self.ctx)?)
    }

    /// Fail with the mock's recorded violations, if any.
    pub fn check(&self) -> Result<()> {
        let violations = self.device.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(TestError::Violation(violations.join("; ")))
        }
    }
}

/// Image registry whose slots can be swapped between binds.
#[derive(Debug, Default)]
pub struct MockImages {
    slots: Mutex<HashMap<ImageSlot, ImageDescriptorInfo>>,
    read_only_requests: Mutex<HashMap<ImageSlot, usize>>,
    next: AtomicU64,
}

impl MockImages {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 0x10_0000
    }

    /// Put a new view and sampler into `slot`.
    pub fn assign(&self, slot: ImageSlot) -> ImageDescriptorInfo {
        let (view, sampler) = (self.fresh(), self.fresh());
        let info = ImageDescriptorInfo {
            view: vk::ImageView::from_raw(view),
            view_id: ResourceId::new(view),
            sampler: vk::Sampler::from_raw(sampler),
            sampler_id: ResourceId::new(sampler),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        self.slots.lock().insert(slot, info);
        info
    }

    /// Recreate only the view of `slot`, keeping its sampler.
    pub fn replace_view(&self, slot: ImageSlot) -> Option<ImageDescriptorInfo> {
        let view = self.fresh();
        let mut slots = self.slots.lock();
        let info = slots.get_mut(&slot)?;
        info.view = vk::ImageView::from_raw(view);
        info.view_id = ResourceId::new(view);
        Some(*info)
    }

    /// Recreate only the sampler of `slot`.
    pub fn replace_sampler(&self, slot: ImageSlot) -> Option<ImageDescriptorInfo> {
        let sampler = self.fresh();
        let mut slots = self.slots.lock();
        let info = slots.get_mut(&slot)?;
        info.sampler = vk::Sampler::from_raw(sampler);
        info.sampler_id = ResourceId::new(sampler);
        Some(*info)
    }

    pub fn clear(&self, slot: ImageSlot) {
        self.slots.lock().remove(&slot);
    }

    /// How often a read-only layout was requested for `slot`.
    pub fn read_only_requests(&self, slot: ImageSlot) -> usize {
        self.read_only_requests.lock().get(&slot).copied().unwrap_or(0)
    }
}

impl ImageRegistry for MockImages {
    fn lookup(&self, slot: ImageSlot) -> Option<ImageDescriptorInfo> {
        self.slots.lock().get(&slot).copied()
    }

    fn request_read_only_layout(&self, slot: ImageSlot) {
        *self.read_only_requests.lock().entry(slot).or_default() += 1;
    }
}
