//! Pipeline state caching.
//!
//! A pipeline owns its descriptor set layout, pipeline layout and one
//! [`DescriptorSetPool`] per frame slot. Executable objects are compiled on
//! first use and cached: once for compute, once per [`PipelineStateKey`] for
//! graphics.

use crate::binding::{BindingLayout, DescriptorBinding};
use crate::buffer::BufferAllocator;
use crate::context::{RenderContext, ResourceId};
use crate::descriptors::{BoundSet, DescriptorSetPool};
use crate::device::{GraphicsPipelineDesc, VertexInputLayout};
use crate::error::{GpuError, Result};
use crate::images::ImageRegistry;
use crate::registry::SlotPools;
use crate::retire::Retired;
use crate::shader::{BytecodeProvider, ShaderBytecode, ShaderStage};
use crate::state::PipelineStateKey;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Snapshot of one slot's descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub cursor: Option<usize>,
    pub writes: u64,
}

enum Executables {
    Compute {
        shader: ShaderBytecode,
        handle: Option<vk::Pipeline>,
    },
    Graphics {
        vertex: ShaderBytecode,
        fragment: ShaderBytecode,
        vertex_input: VertexInputLayout,
        variants: HashMap<PipelineStateKey, vk::Pipeline>,
    },
}

impl Executables {
    fn drain(&mut self) -> Vec<vk::Pipeline> {
        match self {
            Self::Compute { handle, .. } => handle.take().into_iter().collect(),
            Self::Graphics { variants, .. } => variants.drain().map(|(_, p)| p).collect(),
        }
    }
}

struct PipelineState {
    executables: Executables,
    pools: Vec<DescriptorSetPool>,
    torn_down: bool,
}

/// Layouts, pools and executables shared by the typed pipeline wrappers.
pub(crate) struct PipelineCore {
    id: ResourceId,
    name: String,
    ctx: Arc<RenderContext>,
    bindings: Arc<BindingLayout>,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    state: Mutex<PipelineState>,
}

impl PipelineCore {
    fn create(
        ctx: &Arc<RenderContext>,
        name: String,
        declarations: &[DescriptorBinding],
        executables: Executables,
        bind_point: vk::PipelineBindPoint,
    ) -> Result<Arc<Self>> {
        let bindings = Arc::new(BindingLayout::new(declarations)?);
        if let Some(block) = bindings.push_constants() {
            let limit = ctx.limits().max_push_constants_size;
            if block.byte_size == 0 || block.byte_size % 4 != 0 || block.byte_size > limit {
                return Err(GpuError::InvalidState(format!(
                    "{name}: push constant block of {} bytes (limit {limit}, multiple of 4)",
                    block.byte_size
                )));
            }
        }

        let device = ctx.device();
        let set_layout = device.create_descriptor_set_layout(&bindings.layout_bindings())?;
        let layout = match device
            .create_pipeline_layout(set_layout, bindings.push_constants().map(|b| b.range()))
        {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy_descriptor_set_layout(set_layout);
                return Err(e);
            }
        };

        let pools = match make_pools(ctx, &bindings, set_layout, ctx.frames_in_flight()) {
            Ok(pools) => pools,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                device.destroy_descriptor_set_layout(set_layout);
                return Err(e);
            }
        };

        let core = Arc::new(Self {
            id: ctx.next_resource_id(),
            name,
            ctx: Arc::clone(ctx),
            bindings,
            set_layout,
            layout,
            bind_point,
            state: Mutex::new(PipelineState {
                executables,
                pools,
                torn_down: false,
            }),
        });

        let weak: Weak<dyn SlotPools> = Arc::downgrade(&core) as Weak<dyn SlotPools>;
        ctx.pipelines().register(core.id, weak);
        tracing::debug!(pipeline = %core.name, id = core.id.raw(), "Pipeline registered");
        Ok(core)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub(crate) fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub(crate) fn bindings(&self) -> &BindingLayout {
        &self.bindings
    }

    fn compute_handle(&self) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Err(self.torn_down_error());
        }
        match &mut state.executables {
            Executables::Compute { shader, handle } => {
                if let Some(pipeline) = handle {
                    return Ok(*pipeline);
                }
                let pipeline = self
                    .ctx
                    .device()
                    .create_compute_pipeline(self.layout, shader)
                    .map_err(|e| self.compile_error(&e))?;
                tracing::debug!(pipeline = %self.name, "Compiled compute pipeline");
                *handle = Some(pipeline);
                Ok(pipeline)
            }
            Executables::Graphics { .. } => Err(GpuError::InvalidState(format!(
                "{} is a graphics pipeline",
                self.name
            ))),
        }
    }

    fn graphics_handle(&self, key: &PipelineStateKey) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Err(self.torn_down_error());
        }
        match &mut state.executables {
            Executables::Graphics {
                vertex,
                fragment,
                vertex_input,
                variants,
            } => {
                if let Some(pipeline) = variants.get(key) {
                    return Ok(*pipeline);
                }
                let desc = GraphicsPipelineDesc {
                    vertex,
                    fragment,
                    vertex_input,
                    state: key,
                };
                let pipeline = self
                    .ctx
                    .device()
                    .create_graphics_pipeline(self.layout, &desc)
                    .map_err(|e| self.compile_error(&e))?;
                tracing::debug!(
                    pipeline = %self.name,
                    state = key.bits(),
                    variants = variants.len() + 1,
                    "Compiled graphics pipeline variant"
                );
                variants.insert(*key, pipeline);
                Ok(pipeline)
            }
            Executables::Compute { .. } => Err(GpuError::InvalidState(format!(
                "{} is a compute pipeline",
                self.name
            ))),
        }
    }

    fn variant_count(&self) -> usize {
        match &self.state.lock().executables {
            Executables::Compute { handle, .. } => usize::from(handle.is_some()),
            Executables::Graphics { variants, .. } => variants.len(),
        }
    }

    /// Bind through the pool of `slot`. `None` when the pipeline declares no
    /// buffer or image bindings.
    pub(crate) fn bind_set(
        &self,
        slot: usize,
        buffer: Option<&BufferAllocator>,
        offsets: &[u64],
        images: &dyn ImageRegistry,
    ) -> Result<Option<BoundSet>> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Err(self.torn_down_error());
        }
        if self.bindings.buffers().is_empty() && self.bindings.images().is_empty() {
            return Ok(None);
        }
        let pool = state.pools.get_mut(slot).ok_or_else(|| {
            GpuError::InvalidState(format!("{} has no descriptor pool for slot {slot}", self.name))
        })?;
        pool.bind(buffer, offsets, images).map(Some)
    }

    fn pool_stats(&self, slot: usize) -> Option<PoolStats> {
        let state = self.state.lock();
        state.pools.get(slot).map(|pool| PoolStats {
            pool_size: pool.pool_size(),
            cursor: pool.cursor(),
            writes: pool.writes(),
        })
    }

    /// Retire every owned object and leave the registry. Idempotent.
    fn teardown(&self) {
        {
            let mut state = self.state.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            for pipeline in state.executables.drain() {
                self.ctx.retire(Retired::Pipeline(pipeline));
            }
            state.pools.clear();
        }
        self.ctx.retire(Retired::PipelineLayout(self.layout));
        self.ctx.retire(Retired::DescriptorSetLayout(self.set_layout));
        self.ctx.pipelines().unregister(self.id);
        tracing::debug!(pipeline = %self.name, "Pipeline torn down");
    }

    fn torn_down_error(&self) -> GpuError {
        GpuError::InvalidState(format!("{} has been torn down", self.name))
    }

    fn compile_error(&self, source: &GpuError) -> GpuError {
        GpuError::PipelineCreation(format!("{}: {source}", self.name))
    }
}

impl SlotPools for PipelineCore {
    fn reset_cursor(&self, slot: usize) {
        if let Some(pool) = self.state.lock().pools.get_mut(slot) {
            pool.reset_cursor();
        }
    }

    fn recreate_pools(&self, frames: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Ok(());
        }
        state.pools.clear();
        state.pools = make_pools(&self.ctx, &self.bindings, self.set_layout, frames)?;
        Ok(())
    }
}

impl Drop for PipelineCore {
    fn drop(&mut self) {
        if !self.state.get_mut().torn_down {
            tracing::warn!(pipeline = %self.name, "Pipeline dropped without teardown");
            self.teardown();
        }
    }
}

fn make_pools(
    ctx: &Arc<RenderContext>,
    bindings: &Arc<BindingLayout>,
    set_layout: vk::DescriptorSetLayout,
    frames: usize,
) -> Result<Vec<DescriptorSetPool>> {
    if bindings.buffers().is_empty() && bindings.images().is_empty() {
        return Ok(Vec::new());
    }
    let initial = ctx.config().initial_descriptor_sets;
    (0..frames.max(1))
        .map(|slot| {
            DescriptorSetPool::new(Arc::clone(ctx), Arc::clone(bindings), set_layout, slot, initial)
        })
        .collect()
}

/// Compute pipeline with a single cached executable.
pub struct ComputePipeline {
    core: Arc<PipelineCore>,
}

impl ComputePipeline {
    pub fn builder(name: impl Into<String>) -> ComputePipelineBuilder {
        ComputePipelineBuilder::new(name)
    }

    pub fn id(&self) -> ResourceId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.core.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.core.set_layout
    }

    pub fn bindings(&self) -> &BindingLayout {
        self.core.bindings()
    }

    /// The executable, compiled on first call.
    pub fn handle(&self) -> Result<vk::Pipeline> {
        self.core.compute_handle()
    }

    /// Whether the executable has been compiled.
    pub fn is_compiled(&self) -> bool {
        self.core.variant_count() > 0
    }

    /// Descriptor pool state of `slot`.
    pub fn pool_stats(&self, slot: usize) -> Option<PoolStats> {
        self.core.pool_stats(slot)
    }

    pub(crate) fn core(&self) -> &PipelineCore {
        &self.core
    }

    /// Retire the executable, layouts and pools, and unregister.
    pub fn teardown(self) {
        self.core.teardown();
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("name", &self.core.name)
            .field("id", &self.core.id)
            .finish()
    }
}

/// Graphics pipeline caching one executable per state key.
pub struct GraphicsPipeline {
    core: Arc<PipelineCore>,
}

impl GraphicsPipeline {
    pub fn builder(name: impl Into<String>) -> GraphicsPipelineBuilder {
        GraphicsPipelineBuilder::new(name)
    }

    pub fn id(&self) -> ResourceId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.core.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.core.set_layout
    }

    pub fn bindings(&self) -> &BindingLayout {
        self.core.bindings()
    }

    /// The executable for `key`, compiled on first request.
    pub fn handle(&self, key: &PipelineStateKey) -> Result<vk::Pipeline> {
        self.core.graphics_handle(key)
    }

    /// Number of compiled variants.
    pub fn variant_count(&self) -> usize {
        self.core.variant_count()
    }

    /// Descriptor pool state of `slot`.
    pub fn pool_stats(&self, slot: usize) -> Option<PoolStats> {
        self.core.pool_stats(slot)
    }

    pub(crate) fn core(&self) -> &PipelineCore {
        &self.core
    }

    /// Retire every variant, layouts and pools, and unregister.
    pub fn teardown(self) {
        self.core.teardown();
    }
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("name", &self.core.name)
            .field("id", &self.core.id)
            .field("variants", &self.variant_count())
            .finish()
    }
}

/// Builder for [`ComputePipeline`].
pub struct ComputePipelineBuilder {
    name: String,
    bindings: Vec<DescriptorBinding>,
    shader: Option<ShaderBytecode>,
    prewarm: bool,
}

impl ComputePipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            shader: None,
            prewarm: false,
        }
    }

    pub fn binding(mut self, binding: DescriptorBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn bindings(mut self, bindings: impl IntoIterator<Item = DescriptorBinding>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn shader(mut self, shader: ShaderBytecode) -> Self {
        self.shader = Some(shader);
        self
    }

    /// Fetch the compute stage of `name` from a bytecode provider.
    pub fn shader_from(self, provider: &dyn BytecodeProvider, name: &str) -> Result<Self> {
        let shader = provider.bytecode(name, ShaderStage::Compute)?;
        Ok(self.shader(shader))
    }

    /// Compile the executable during `build` instead of on first use.
    pub fn prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }

    pub fn build(self, ctx: &Arc<RenderContext>) -> Result<ComputePipeline> {
        let shader = self.shader.ok_or_else(|| {
            GpuError::ShaderCompilation(format!("{}: no compute shader supplied", self.name))
        })?;
        check_stage(&self.name, &shader, ShaderStage::Compute)?;

        let core = PipelineCore::create(
            ctx,
            self.name,
            &self.bindings,
            Executables::Compute {
                shader,
                handle: None,
            },
            vk::PipelineBindPoint::COMPUTE,
        )?;
        let pipeline = ComputePipeline { core };
        if self.prewarm {
            pipeline.handle()?;
        }
        Ok(pipeline)
    }
}

/// Builder for [`GraphicsPipeline`].
pub struct GraphicsPipelineBuilder {
    name: String,
    bindings: Vec<DescriptorBinding>,
    vertex: Option<ShaderBytecode>,
    fragment: Option<ShaderBytecode>,
    vertex_input: VertexInputLayout,
    prewarm: Vec<PipelineStateKey>,
}

impl GraphicsPipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            vertex: None,
            fragment: None,
            vertex_input: VertexInputLayout::default(),
            prewarm: Vec::new(),
        }
    }

    pub fn binding(mut self, binding: DescriptorBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn bindings(mut self, bindings: impl IntoIterator<Item = DescriptorBinding>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn vertex_shader(mut self, shader: ShaderBytecode) -> Self {
        self.vertex = Some(shader);
        self
    }

    pub fn fragment_shader(mut self, shader: ShaderBytecode) -> Self {
        self.fragment = Some(shader);
        self
    }

    /// Fetch both stages of `name` from a bytecode provider.
    pub fn shaders_from(self, provider: &dyn BytecodeProvider, name: &str) -> Result<Self> {
        let vertex = provider.bytecode(name, ShaderStage::Vertex)?;
        let fragment = provider.bytecode(name, ShaderStage::Fragment)?;
        Ok(self.vertex_shader(vertex).fragment_shader(fragment))
    }

    pub fn vertex_input(mut self, layout: VertexInputLayout) -> Self {
        self.vertex_input = layout;
        self
    }

    /// Compile the variant for `key` during `build`.
    pub fn prewarm(mut self, key: PipelineStateKey) -> Self {
        self.prewarm.push(key);
        self
    }

    pub fn build(self, ctx: &Arc<RenderContext>) -> Result<GraphicsPipeline> {
        let vertex = self.vertex.ok_or_else(|| {
            GpuError::ShaderCompilation(format!("{}: no vertex shader supplied", self.name))
        })?;
        let fragment = self.fragment.ok_or_else(|| {
            GpuError::ShaderCompilation(format!("{}: no fragment shader supplied", self.name))
        })?;
        check_stage(&self.name, &vertex, ShaderStage::Vertex)?;
        check_stage(&self.name, &fragment, ShaderStage::Fragment)?;

        let core = PipelineCore::create(
            ctx,
            self.name,
            &self.bindings,
            Executables::Graphics {
                vertex,
                fragment,
                vertex_input: self.vertex_input,
                variants: HashMap::new(),
            },
            vk::PipelineBindPoint::GRAPHICS,
        )?;
        let pipeline = GraphicsPipeline { core };
        for key in &self.prewarm {
            pipeline.handle(key)?;
        }
        Ok(pipeline)
    }
}

fn check_stage(name: &str, shader: &ShaderBytecode, expected: ShaderStage) -> Result<()> {
    if shader.stage() == expected {
        Ok(())
    } else {
        Err(GpuError::ShaderCompilation(format!(
            "{name}: expected {expected:?} bytecode, got {:?}",
            shader.stage()
        )))
    }
}
