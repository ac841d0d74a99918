//! In-memory implementation of [`GpuDevice`].
//!
//! Buffers live in host memory, descriptor writes and recorded commands are
//! kept for inspection, and fences either signal on submit or wait for the
//! test to signal them. Compute dispatches run registered host kernels over
//! the bound buffer ranges when their submission executes.

use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strata_gpu::{
    BufferDesc, DescriptorWrite, DeviceBuffer, DeviceLimits, DrawParams, GpuDevice, GpuError,
    GpuObject, GraphicsPipelineDesc, MappedPtr, MemoryBarrier, PipelineStateKey, RenderTarget,
    Result,
    ShaderBytecode,
};

/// When submitted work executes and its fence signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// Execute and signal during `submit`.
    AutoSignal,
    /// Execute and signal only when the test calls [`MockDevice::signal_fence`].
    Manual,
}

/// Kind of mock object, for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    DescriptorSetLayout,
    PipelineLayout,
    DescriptorPool,
    DescriptorSet,
    Pipeline,
    Fence,
    CommandBuffer,
}

/// A recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: Vec<u32>,
    },
    PushConstants(Vec<u8>),
    Dispatch([u32; 3]),
    BeginRendering(vk::Extent2D),
    EndRendering,
    BindVertexBuffers(Vec<vk::Buffer>),
    Draw(DrawParams),
    Barrier(MemoryBarrier),
}

/// Host kernel run for a compute dispatch.
pub type Kernel = Arc<dyn Fn(&mut KernelContext<'_>) + Send + Sync>;

/// Buffer ranges and push constants visible to a kernel.
pub struct KernelContext<'a> {
    ranges: BTreeMap<u32, (MappedPtr, usize)>,
    push_constants: &'a [u8],
    groups: [u32; 3],
}

impl KernelContext<'_> {
    /// Copy of the range bound at `binding`.
    pub fn read(&self, binding: u32) -> Vec<u8> {
        self.ranges.get(&binding).map_or_else(Vec::new, |(ptr, len)| {
            // SAFETY: the range was checked against the buffer size before
            // the kernel ran, and no other access happens meanwhile.
            unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len).to_vec() }
        })
    }

    /// Overwrite the start of the range bound at `binding`.
    pub fn write(&mut self, binding: u32, data: &[u8]) {
        if let Some((ptr, len)) = self.ranges.get(&binding) {
            let count = data.len().min(*len);
            // SAFETY: see `read`.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), count) };
        }
    }

    pub fn push_constants(&self) -> &[u8] {
        self.push_constants
    }

    pub fn groups(&self) -> [u32; 3] {
        self.groups
    }
}

/// Kernel adding `value` to every `u32` of binding 0.
pub fn add_kernel(value: u32) -> Kernel {
    Arc::new(move |ctx: &mut KernelContext<'_>| {
        let bytes = ctx.read(0);
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| bytemuck::pod_read_unaligned::<u32>(chunk).wrapping_add(value))
            .collect();
        ctx.write(0, bytemuck::cast_slice(&words));
    })
}

struct MockBuffer {
    base: MappedPtr,
    size: usize,
}

impl MockBuffer {
    fn new(size: usize) -> Self {
        let storage: Box<[u8]> = vec![0u8; size.max(1)].into_boxed_slice();
        let raw = Box::into_raw(storage).cast::<u8>();
        Self {
            base: MappedPtr::new(std::ptr::NonNull::new(raw).unwrap_or(std::ptr::NonNull::dangling())),
            size,
        }
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.size.max(1));
        // SAFETY: allocated in `new` with this exact length and freed only here.
        drop(unsafe { Box::from_raw(slice) });
    }
}

enum MockObject {
    Buffer(MockBuffer),
    DescriptorSetLayout,
    PipelineLayout,
    DescriptorPool {
        max_sets: u32,
        sets: Vec<u64>,
    },
    DescriptorSet {
        writes: BTreeMap<u32, DescriptorWrite>,
    },
    Pipeline {
        kernel: Option<u32>,
        state: Option<PipelineStateKey>,
    },
    CommandBuffer {
        commands: Vec<Command>,
        recording: bool,
    },
}

impl MockObject {
    fn kind(&self) -> ObjectKind {
        match self {
            Self::Buffer(_) => ObjectKind::Buffer,
            Self::DescriptorSetLayout => ObjectKind::DescriptorSetLayout,
            Self::PipelineLayout => ObjectKind::PipelineLayout,
            Self::DescriptorPool { .. } => ObjectKind::DescriptorPool,
            Self::DescriptorSet { .. } => ObjectKind::DescriptorSet,
            Self::Pipeline { .. } => ObjectKind::Pipeline,
            Self::CommandBuffer { .. } => ObjectKind::CommandBuffer,
        }
    }
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    pending: Option<Vec<Command>>,
}

/// Counters collected by the mock.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub created: HashMap<ObjectKind, usize>,
    pub destroyed: HashMap<ObjectKind, usize>,
    /// `update_descriptor_set` calls.
    pub descriptor_writes: usize,
    pub submits: usize,
    /// Commands of every submission, in submission order.
    pub submitted: Vec<Vec<Command>>,
    /// Accesses to objects that were already destroyed.
    pub violations: Vec<String>,
}

/// In-memory device with inspectable state.
pub struct MockDevice {
    limits: DeviceLimits,
    mode: FenceMode,
    next_handle: AtomicU64,
    objects: Mutex<HashMap<u64, MockObject>>,
    fences: Mutex<HashMap<u64, FenceState>>,
    fence_signal: Condvar,
    order: Mutex<VecDeque<u64>>,
    kernels: Mutex<HashMap<u32, Kernel>>,
    stats: Mutex<MockStats>,
    fail_pipelines: AtomicBool,
    fail_submits: AtomicBool,
}

impl MockDevice {
    pub fn new(mode: FenceMode) -> Self {
        Self::with_limits(mode, DeviceLimits::default())
    }

    pub fn with_limits(mode: FenceMode, limits: DeviceLimits) -> Self {
        Self {
            limits,
            mode,
            next_handle: AtomicU64::new(0x1000),
            objects: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            fence_signal: Condvar::new(),
            order: Mutex::new(VecDeque::new()),
            kernels: Mutex::new(HashMap::new()),
            stats: Mutex::new(MockStats::default()),
            fail_pipelines: AtomicBool::new(false),
            fail_submits: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> FenceMode {
        self.mode
    }

    /// Run `kernel` for compute pipelines whose bytecode's second word is `id`.
    pub fn register_kernel(&self, id: u32, kernel: Kernel) {
        self.kernels.lock().insert(id, kernel);
    }

    /// Make subsequent pipeline compilations fail.
    pub fn fail_pipelines(&self, fail: bool) {
        self.fail_pipelines.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent queue submissions fail.
    pub fn fail_submits(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::Relaxed);
    }

    pub fn stats(&self) -> MockStats {
        self.stats.lock().clone()
    }

    pub fn descriptor_writes(&self) -> usize {
        self.stats.lock().descriptor_writes
    }

    pub fn violations(&self) -> Vec<String> {
        self.stats.lock().violations.clone()
    }

    /// Number of live objects of `kind`.
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.objects
            .lock()
            .values()
            .filter(|object| object.kind() == kind)
            .count()
            + if kind == ObjectKind::Fence {
                self.fences.lock().len()
            } else {
                0
            }
    }

    pub fn created(&self, kind: ObjectKind) -> usize {
        self.stats.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn destroyed(&self, kind: ObjectKind) -> usize {
        self.stats.lock().destroyed.get(&kind).copied().unwrap_or(0)
    }

    /// Whether the object with this handle still exists.
    pub fn is_live<H: Handle>(&self, handle: H) -> bool {
        let raw = handle.as_raw();
        self.objects.lock().contains_key(&raw) || self.fences.lock().contains_key(&raw)
    }

    /// Buffer bound at `binding` of `set`, as last written.
    pub fn set_write(&self, set: vk::DescriptorSet, binding: u32) -> Option<DescriptorWrite> {
        match self.objects.lock().get(&set.as_raw()) {
            Some(MockObject::DescriptorSet { writes }) => writes.get(&binding).copied(),
            _ => None,
        }
    }

    /// State key a graphics pipeline was compiled with.
    pub fn pipeline_state(&self, pipeline: vk::Pipeline) -> Option<PipelineStateKey> {
        match self.objects.lock().get(&pipeline.as_raw()) {
            Some(MockObject::Pipeline { state, .. }) => *state,
            _ => None,
        }
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.fences
            .lock()
            .get(&fence.as_raw())
            .is_some_and(|state| state.signaled)
    }

    /// Fences of submissions that have not executed yet, oldest first.
    pub fn pending_fences(&self) -> Vec<vk::Fence> {
        self.order.lock().iter().map(|raw| vk::Fence::from_raw(*raw)).collect()
    }

    /// Execute the submission guarded by `fence` and signal it.
    pub fn signal_fence(&self, fence: vk::Fence) {
        let raw = fence.as_raw();
        let pending = self
            .fences
            .lock()
            .get_mut(&raw)
            .and_then(|state| state.pending.take());
        if let Some(commands) = pending {
            self.execute(&commands);
        }
        self.order.lock().retain(|entry| *entry != raw);

        let mut fences = self.fences.lock();
        if let Some(state) = fences.get_mut(&raw) {
            state.signaled = true;
        }
        self.fence_signal.notify_all();
    }

    /// Execute and signal every pending submission in order.
    pub fn signal_all(&self) {
        for fence in self.pending_fences() {
            self.signal_fence(fence);
        }
    }

    fn handle<H: Handle>(&self, kind: ObjectKind) -> H {
        *self.stats.lock().created.entry(kind).or_default() += 1;
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn remove(&self, raw: u64) -> Option<MockObject> {
        let removed = self.objects.lock().remove(&raw);
        match &removed {
            Some(object) => {
                *self.stats.lock().destroyed.entry(object.kind()).or_default() += 1;
            }
            None => self.violation(format!("destroying unknown object {raw:#x}")),
        }
        removed
    }

    fn violation(&self, message: String) {
        tracing::error!("{message}");
        self.stats.lock().violations.push(message);
    }

    fn record(&self, cmd: vk::CommandBuffer, command: Command) {
        let mut objects = self.objects.lock();
        match objects.get_mut(&cmd.as_raw()) {
            Some(MockObject::CommandBuffer {
                commands,
                recording: true,
            }) => commands.push(command),
            _ => self.violation(format!("recording {command:?} outside of recording")),
        }
    }

    fn execute(&self, commands: &[Command]) {
        let mut pipeline = None;
        let mut bound_set = None;
        let mut push_constants: &[u8] = &[];
        let mut rendering = false;

        for command in commands {
            match command {
                Command::BindPipeline { pipeline: p, .. } => pipeline = Some(*p),
                Command::BindDescriptorSet {
                    set,
                    dynamic_offsets,
                    ..
                } => bound_set = Some((*set, dynamic_offsets.as_slice())),
                Command::PushConstants(data) => push_constants = data.as_slice(),
                Command::Dispatch(groups) => {
                    self.dispatch(pipeline, bound_set, push_constants, *groups);
                }
                Command::BindVertexBuffers(buffers) => {
                    for buffer in buffers {
                        if !self.is_live(*buffer) {
                            self.violation(format!("vertex buffer {buffer:?} used after destroy"));
                        }
                    }
                }
                Command::Draw(_) => {
                    if let Some((set, _)) = bound_set {
                        self.ranges(set, &[]);
                    }
                }
                Command::BeginRendering(_) => rendering = true,
                Command::EndRendering => rendering = false,
                Command::Barrier(_) => {
                    if rendering {
                        self.violation("barrier recorded inside rendering".to_string());
                    }
                }
            }
        }
    }

    fn dispatch(
        &self,
        pipeline: Option<vk::Pipeline>,
        bound_set: Option<(vk::DescriptorSet, &[u32])>,
        push_constants: &[u8],
        groups: [u32; 3],
    ) {
        let Some(pipeline) = pipeline else {
            self.violation("dispatch without a bound pipeline".to_string());
            return;
        };
        let kernel_id = match self.objects.lock().get(&pipeline.as_raw()) {
            Some(MockObject::Pipeline { kernel, .. }) => *kernel,
            _ => {
                self.violation(format!("pipeline {pipeline:?} used after destroy"));
                return;
            }
        };
        let ranges = match bound_set {
            Some((set, offsets)) => match self.ranges(set, offsets) {
                Some(ranges) => ranges,
                None => return,
            },
            None => BTreeMap::new(),
        };

        let kernel = kernel_id.and_then(|id| self.kernels.lock().get(&id).cloned());
        if let Some(kernel) = kernel {
            let mut ctx = KernelContext {
                ranges,
                push_constants,
                groups,
            };
            kernel(&mut ctx);
        }
    }

    /// Resolve the buffer ranges of `set`, consuming dynamic offsets in
    /// binding order.
    fn ranges(
        &self,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) -> Option<BTreeMap<u32, (MappedPtr, usize)>> {
        let objects = self.objects.lock();
        let Some(MockObject::DescriptorSet { writes }) = objects.get(&set.as_raw()) else {
            self.violation(format!("descriptor set {set:?} used after its pool was destroyed"));
            return None;
        };

        let mut dynamic = dynamic_offsets.iter();
        let mut ranges = BTreeMap::new();
        let mut errors = Vec::new();
        for (binding, write) in writes {
            let DescriptorWrite::Buffer {
                ty,
                buffer,
                offset,
                range,
                ..
            } = *write
            else {
                continue;
            };
            let extra = if matches!(
                ty,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
            ) {
                u64::from(dynamic.next().copied().unwrap_or(0))
            } else {
                0
            };
            match objects.get(&buffer.as_raw()) {
                Some(MockObject::Buffer(storage)) => {
                    let start = offset + extra;
                    if start + range > storage.size as u64 {
                        errors.push(format!(
                            "binding {binding} range {start}..{} exceeds buffer of {} bytes",
                            start + range,
                            storage.size
                        ));
                        continue;
                    }
                    // SAFETY: `start + range` lies within the allocation.
                    let ptr = unsafe { storage.base.as_ptr().add(start as usize) };
                    if let Some(ptr) = std::ptr::NonNull::new(ptr) {
                        ranges.insert(*binding, (MappedPtr::new(ptr), range as usize));
                    }
                }
                _ => errors.push(format!("buffer {buffer:?} used after destroy")),
            }
        }
        drop(objects);
        for error in errors {
            self.violation(error);
        }
        Some(ranges)
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new(FenceMode::AutoSignal)
    }
}

impl GpuDevice for MockDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<DeviceBuffer> {
        let size = usize::try_from(desc.size)
            .map_err(|_| GpuError::AllocationFailed(format!("{}: too large", desc.name)))?;
        let storage = MockBuffer::new(size);
        let mapped = desc.memory.is_mappable().then_some(storage.base);
        let buffer: vk::Buffer = self.handle(ObjectKind::Buffer);
        self.objects
            .lock()
            .insert(buffer.as_raw(), MockObject::Buffer(storage));
        Ok(DeviceBuffer {
            buffer,
            size: desc.size,
            memory: desc.memory,
            usage: desc.usage,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.remove(buffer.buffer.as_raw());
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let layout: vk::DescriptorSetLayout = self.handle(ObjectKind::DescriptorSetLayout);
        self.objects
            .lock()
            .insert(layout.as_raw(), MockObject::DescriptorSetLayout);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.remove(layout.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        _set_layout: vk::DescriptorSetLayout,
        _push_constants: Option<vk::PushConstantRange>,
    ) -> Result<vk::PipelineLayout> {
        let layout: vk::PipelineLayout = self.handle(ObjectKind::PipelineLayout);
        self.objects
            .lock()
            .insert(layout.as_raw(), MockObject::PipelineLayout);
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.remove(layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let pool: vk::DescriptorPool = self.handle(ObjectKind::DescriptorPool);
        self.objects.lock().insert(
            pool.as_raw(),
            MockObject::DescriptorPool {
                max_sets,
                sets: Vec::new(),
            },
        );
        Ok(pool)
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let sets: Vec<vk::DescriptorSet> = (0..count)
            .map(|_| self.handle(ObjectKind::DescriptorSet))
            .collect();

        let mut objects = self.objects.lock();
        match objects.get_mut(&pool.as_raw()) {
            Some(MockObject::DescriptorPool {
                max_sets,
                sets: owned,
            }) => {
                if owned.len() + sets.len() > *max_sets as usize {
                    return Err(GpuError::creation(GpuObject::DescriptorSet)(
                        vk::Result::ERROR_OUT_OF_POOL_MEMORY,
                    ));
                }
                owned.extend(sets.iter().map(|set| set.as_raw()));
            }
            _ => {
                return Err(GpuError::creation(GpuObject::DescriptorSet)(
                    vk::Result::ERROR_UNKNOWN,
                ))
            }
        }
        for set in &sets {
            objects.insert(
                set.as_raw(),
                MockObject::DescriptorSet {
                    writes: BTreeMap::new(),
                },
            );
        }
        Ok(sets)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if let Some(MockObject::DescriptorPool { sets, .. }) = self.remove(pool.as_raw()) {
            let mut objects = self.objects.lock();
            for set in &sets {
                objects.remove(set);
            }
            drop(objects);
            *self
                .stats
                .lock()
                .destroyed
                .entry(ObjectKind::DescriptorSet)
                .or_default() += sets.len();
        }
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.stats.lock().descriptor_writes += 1;
        let mut objects = self.objects.lock();
        match objects.get_mut(&set.as_raw()) {
            Some(MockObject::DescriptorSet { writes: current }) => {
                for write in writes {
                    current.insert(write.binding(), *write);
                }
            }
            _ => self.violation(format!("writing destroyed descriptor set {set:?}")),
        }
    }

    fn create_compute_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        shader: &ShaderBytecode,
    ) -> Result<vk::Pipeline> {
        if self.fail_pipelines.load(Ordering::Relaxed) {
            return Err(GpuError::creation(GpuObject::Pipeline)(
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }
        let pipeline: vk::Pipeline = self.handle(ObjectKind::Pipeline);
        self.objects.lock().insert(
            pipeline.as_raw(),
            MockObject::Pipeline {
                kernel: shader.words().get(1).copied(),
                state: None,
            },
        );
        Ok(pipeline)
    }

    fn create_graphics_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<vk::Pipeline> {
        if self.fail_pipelines.load(Ordering::Relaxed) {
            return Err(GpuError::creation(GpuObject::Pipeline)(
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }
        let pipeline: vk::Pipeline = self.handle(ObjectKind::Pipeline);
        self.objects.lock().insert(
            pipeline.as_raw(),
            MockObject::Pipeline {
                kernel: None,
                state: Some(*desc.state),
            },
        );
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.remove(pipeline.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence: vk::Fence = self.handle(ObjectKind::Fence);
        self.fences.lock().insert(
            fence.as_raw(),
            FenceState {
                signaled,
                pending: None,
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if self.fences.lock().remove(&fence.as_raw()).is_some() {
            *self
                .stats
                .lock()
                .destroyed
                .entry(ObjectKind::Fence)
                .or_default() += 1;
        } else {
            self.violation(format!("destroying unknown fence {fence:?}"));
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        let raw = fence.as_raw();
        let mut fences = self.fences.lock();
        loop {
            match fences.get(&raw).map(|state| state.signaled) {
                Some(true) => return Ok(()),
                Some(false) => self.fence_signal.wait(&mut fences),
                None => return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
            }
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        self.fences
            .lock()
            .get(&fence.as_raw())
            .map(|state| state.signaled)
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        match self.fences.lock().get_mut(&fence.as_raw()) {
            Some(state) => {
                state.signaled = false;
                Ok(())
            }
            None => Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
        }
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let cmd: vk::CommandBuffer = self.handle(ObjectKind::CommandBuffer);
        self.objects.lock().insert(
            cmd.as_raw(),
            MockObject::CommandBuffer {
                commands: Vec::new(),
                recording: false,
            },
        );
        Ok(cmd)
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.remove(cmd.as_raw());
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        match self.objects.lock().get_mut(&cmd.as_raw()) {
            Some(MockObject::CommandBuffer {
                commands,
                recording,
            }) => {
                commands.clear();
                *recording = true;
                Ok(())
            }
            _ => Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
        }
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        match self.objects.lock().get_mut(&cmd.as_raw()) {
            Some(MockObject::CommandBuffer {
                recording: recording @ true,
                ..
            }) => {
                *recording = false;
                Ok(())
            }
            _ => Err(GpuError::InvalidState(format!("{cmd:?} is not recording"))),
        }
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(
            cmd,
            Command::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        self.record(
            cmd,
            Command::BindDescriptorSet {
                layout,
                set,
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        self.record(cmd, Command::PushConstants(data.to_vec()));
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]) {
        self.record(cmd, Command::Dispatch(groups));
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, target: &RenderTarget) {
        self.record(cmd, Command::BeginRendering(target.extent));
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        self.record(cmd, Command::EndRendering);
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        _offsets: &[u64],
    ) {
        self.record(cmd, Command::BindVertexBuffers(buffers.to_vec()));
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, params: &DrawParams) {
        self.record(cmd, Command::Draw(*params));
    }

    fn cmd_memory_barrier(&self, cmd: vk::CommandBuffer, barrier: &MemoryBarrier) {
        self.record(cmd, Command::Barrier(*barrier));
    }

    fn submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        if self.fail_submits.load(Ordering::Relaxed) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let commands = match self.objects.lock().get(&cmd.as_raw()) {
            Some(MockObject::CommandBuffer {
                commands,
                recording: false,
            }) => commands.clone(),
            _ => {
                return Err(GpuError::InvalidState(format!(
                    "{cmd:?} is not an ended command buffer"
                )))
            }
        };
        {
            let mut stats = self.stats.lock();
            stats.submits += 1;
            stats.submitted.push(commands.clone());
        }

        match self.fences.lock().get_mut(&fence.as_raw()) {
            Some(state) if !state.signaled => state.pending = Some(commands),
            Some(_) => {
                return Err(GpuError::InvalidState(format!(
                    "{fence:?} submitted while signaled"
                )))
            }
            None => return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
        }
        self.order.lock().push_back(fence.as_raw());

        if self.mode == FenceMode::AutoSignal {
            self.signal_fence(fence);
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let fences: Vec<vk::Fence> = self.pending_fences();
        for fence in fences {
            self.wait_for_fence(fence)?;
        }
        Ok(())
    }
}
