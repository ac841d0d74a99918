//! Frame-in-flight scheduling.
//!
//! [`FrameScheduler`] cycles through N frame slots, each with a fence, a
//! command buffer and a staging [`BufferAllocator`]. Reusing a slot waits on
//! its fence, so at most N submissions are ever in flight and the (N+1)-th
//! dispatch blocks until the oldest one completes.
//!
//! Submissions are numbered by generation, starting at 1. Objects retired
//! while generation `g` is being recorded are destroyed once every submission
//! up to `g` has been observed complete.

use crate::buffer::BufferAllocator;
use crate::context::RenderContext;
use crate::device::{DrawParams, GpuDevice, MemoryBarrier, MemoryKind, RenderTarget};
use crate::error::{GpuError, Result};
use crate::images::{ImageRegistry, NoImages};
use crate::pipeline::{ComputePipeline, GraphicsPipeline, PipelineCore};
use crate::state::PipelineStateKey;
use ash::vk;
use std::sync::Arc;

/// Lifecycle state of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled; free for reuse.
    Idle,
    /// A [`Frame`] is recording into the slot's command buffer.
    Recording,
    /// Submitted; the fence has not been observed signaled yet.
    InFlight,
}

/// Where the buffer bindings of a workload read from.
#[derive(Debug, Clone)]
pub enum BufferSource<'a> {
    /// One block per buffer binding, in binding-index order, staged into the
    /// slot's staging buffer at aligned offsets. Missing blocks reserve space
    /// without writing.
    Staged(Vec<&'a [u8]>),
    /// An existing buffer bound at explicit offsets, one per buffer binding.
    External {
        buffer: &'a BufferAllocator,
        offsets: Vec<u64>,
    },
}

/// What a workload records.
#[derive(Debug, Clone)]
pub enum Work<'a> {
    Dispatch {
        pipeline: &'a ComputePipeline,
        groups: [u32; 3],
    },
    Draw {
        pipeline: &'a GraphicsPipeline,
        key: PipelineStateKey,
        target: RenderTarget,
        params: DrawParams,
        vertex_buffers: Vec<(vk::Buffer, u64)>,
    },
}

/// One dispatch or draw plus the data it binds.
pub struct Workload<'a> {
    work: Work<'a>,
    buffers: BufferSource<'a>,
    push_constants: Option<&'a [u8]>,
    images: &'a dyn ImageRegistry,
}

impl<'a> Workload<'a> {
    /// A compute dispatch of `groups` workgroups.
    pub fn dispatch(pipeline: &'a ComputePipeline, groups: [u32; 3]) -> Self {
        Self::new(Work::Dispatch { pipeline, groups })
    }

    /// A non-indexed draw into `target` with the variant selected by `key`.
    pub fn draw(
        pipeline: &'a GraphicsPipeline,
        key: PipelineStateKey,
        target: RenderTarget,
        params: DrawParams,
    ) -> Self {
        Self::new(Work::Draw {
            pipeline,
            key,
            target,
            params,
            vertex_buffers: Vec::new(),
        })
    }

    fn new(work: Work<'a>) -> Self {
        Self {
            work,
            buffers: BufferSource::Staged(Vec::new()),
            push_constants: None,
            images: &NoImages,
        }
    }

    /// Stage `data` for the next buffer binding.
    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        if let BufferSource::Staged(blocks) = &mut self.buffers {
            blocks.push(data);
        } else {
            self.buffers = BufferSource::Staged(vec![data]);
        }
        self
    }

    /// Bind `buffer` at `offsets` instead of staging.
    pub fn with_buffer(mut self, buffer: &'a BufferAllocator, offsets: &[u64]) -> Self {
        self.buffers = BufferSource::External {
            buffer,
            offsets: offsets.to_vec(),
        };
        self
    }

    pub fn with_push_constants(mut self, data: &'a [u8]) -> Self {
        self.push_constants = Some(data);
        self
    }

    pub fn with_images(mut self, images: &'a dyn ImageRegistry) -> Self {
        self.images = images;
        self
    }

    /// Bind a vertex buffer for a draw. Ignored by dispatches.
    pub fn with_vertex_buffer(mut self, buffer: vk::Buffer, offset: u64) -> Self {
        if let Work::Draw { vertex_buffers, .. } = &mut self.work {
            vertex_buffers.push((buffer, offset));
        }
        self
    }

    pub fn work(&self) -> &Work<'a> {
        &self.work
    }

    fn core(&self) -> &PipelineCore {
        match &self.work {
            Work::Dispatch { pipeline, .. } => pipeline.core(),
            Work::Draw { pipeline, .. } => pipeline.core(),
        }
    }

    fn executable(&self) -> Result<vk::Pipeline> {
        match &self.work {
            Work::Dispatch { pipeline, .. } => pipeline.handle(),
            Work::Draw { pipeline, key, .. } => pipeline.handle(key),
        }
    }
}

/// Completion handle of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    slot: usize,
    generation: u64,
    fence: vk::Fence,
    staged: Vec<u64>,
}

impl Submission {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fence signaled when the submission completes.
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Offsets of every staged block, in recording order.
    pub fn staged_offsets(&self) -> &[u64] {
        &self.staged
    }
}

struct FrameSlot {
    fence: vk::Fence,
    cmd: vk::CommandBuffer,
    state: SlotState,
    staging: BufferAllocator,
    last_bound: Option<vk::Pipeline>,
    /// Generation of the most recent submission from this slot.
    generation: u64,
}

impl FrameSlot {
    fn new(ctx: &Arc<RenderContext>, index: usize) -> Result<Self> {
        let device = ctx.device();
        let config = ctx.config();
        let staging = BufferAllocator::new(
            Arc::clone(ctx),
            format!("frame-staging-{index}"),
            config.staging_usage,
            MemoryKind::HostVisible,
            config.staging_capacity,
        )?;
        let fence = device.create_fence(true)?;
        let cmd = match device.allocate_command_buffer() {
            Ok(cmd) => cmd,
            Err(e) => {
                device.destroy_fence(fence);
                return Err(e);
            }
        };
        Ok(Self {
            fence,
            cmd,
            state: SlotState::Idle,
            staging,
            last_bound: None,
            generation: 0,
        })
    }

    /// Release the slot's fence and command buffer. The slot must be idle.
    fn destroy(self, device: &dyn GpuDevice) {
        device.free_command_buffer(self.cmd);
        device.destroy_fence(self.fence);
    }
}

/// N-deep frame scheduler.
///
/// Single-threaded: recording and submission happen on the owning thread.
pub struct FrameScheduler {
    ctx: Arc<RenderContext>,
    slots: Vec<FrameSlot>,
    current: usize,
    next_generation: u64,
    /// Highest generation with it and all earlier submissions complete.
    completed: u64,
}

impl FrameScheduler {
    /// Create a scheduler with the context's number of frames in flight.
    pub fn new(ctx: Arc<RenderContext>) -> Result<Self> {
        let slots = create_slots(&ctx, ctx.frames_in_flight())?;
        tracing::info!(frames_in_flight = slots.len(), "Frame scheduler created");
        Ok(Self {
            ctx,
            slots,
            current: 0,
            next_generation: 1,
            completed: 0,
        })
    }

    pub fn context(&self) -> &Arc<RenderContext> {
        &self.ctx
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next frame will record into.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Staging buffer of `slot`.
    pub fn staging(&self, slot: usize) -> Option<&BufferAllocator> {
        self.slots.get(slot).map(|s| &s.staging)
    }

    /// Generation the next submission will carry.
    pub fn next_generation(&self) -> u64 {
        self.next_generation
    }

    /// Highest generation known complete along with every earlier one.
    pub fn completed_generation(&self) -> u64 {
        self.completed
    }

    /// Record and submit a single workload.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn dispatch(&mut self, workload: &Workload<'_>) -> Result<Submission> {
        let mut frame = self.begin_frame()?;
        frame.record(workload)?;
        frame.submit()
    }

    /// Wait for the current slot, reset its per-frame state and start recording.
    ///
    /// Fails with [`GpuError::SlotBusy`] if the slot is still recording. A live
    /// [`Frame`] borrows the scheduler, so this only happens after a frame was
    /// leaked; [`reset_slot`](Self::reset_slot) recovers from it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self) -> Result<Frame<'_>> {
        let index = self.current;
        let ctx = Arc::clone(&self.ctx);
        let device = ctx.device();

        let slot = &mut self.slots[index];
        match slot.state {
            SlotState::Recording => return Err(GpuError::SlotBusy { slot: index }),
            SlotState::InFlight => {
                let _span = tracing::trace_span!("wait_slot", slot = index).entered();
                device.wait_for_fence(slot.fence)?;
                slot.state = SlotState::Idle;
            }
            SlotState::Idle => {}
        }

        self.observe_completions()?;
        {
            let mut retirement = ctx.retirement().lock();
            retirement.collect(device, self.completed)?;
            retirement.set_generation(self.next_generation);
        }

        let slot = &mut self.slots[index];
        slot.staging.reset();
        slot.last_bound = None;
        ctx.pipelines().reset_cursors(index);

        device.begin_commands(slot.cmd)?;
        slot.state = SlotState::Recording;

        Ok(Frame {
            scheduler: self,
            slot: index,
            staged: Vec::new(),
            recorded: 0,
            submitted: false,
        })
    }

    /// Block until `submission` has completed. No timeout.
    ///
    /// Returns immediately if its slot has been reused since, because reuse
    /// already waited on it.
    pub fn wait_for(&self, submission: &Submission) -> Result<()> {
        let Some(slot) = self.slots.get(submission.slot) else {
            return Ok(());
        };
        if slot.generation != submission.generation || slot.fence != submission.fence {
            return Ok(());
        }
        if slot.state == SlotState::InFlight {
            self.ctx.device().wait_for_fence(slot.fence)?;
        }
        Ok(())
    }

    /// Non-blocking completion query.
    pub fn is_complete(&self, submission: &Submission) -> Result<bool> {
        let Some(slot) = self.slots.get(submission.slot) else {
            return Ok(true);
        };
        if slot.generation != submission.generation || slot.state != SlotState::InFlight {
            return Ok(true);
        }
        self.ctx.device().fence_signaled(slot.fence)
    }

    /// Wait for every slot and destroy all retired objects.
    pub fn wait_idle(&mut self) -> Result<()> {
        let device = self.ctx.device();
        for slot in &mut self.slots {
            if slot.state == SlotState::InFlight {
                device.wait_for_fence(slot.fence)?;
                slot.state = SlotState::Idle;
            }
        }
        self.completed = self.next_generation - 1;
        // Nothing is in flight or recording, so everything retired is unreferenced.
        self.ctx.retirement().lock().flush(device)?;
        Ok(())
    }

    /// Return a slot left recording by a leaked [`Frame`] to idle, discarding
    /// whatever it recorded. Returns whether the slot was recording.
    pub fn reset_slot(&mut self, slot: usize) -> bool {
        let Some(frame_slot) = self.slots.get_mut(slot) else {
            return false;
        };
        if frame_slot.state != SlotState::Recording {
            return false;
        }
        frame_slot.state = SlotState::Idle;
        frame_slot.last_bound = None;
        frame_slot.staging.reset();
        tracing::warn!(slot, "Reset a slot left recording");
        true
    }

    /// Change the number of frame slots.
    ///
    /// Waits for all work, rebuilds the slots and recreates every registered
    /// pipeline's per-slot descriptor pools.
    pub fn set_frames_in_flight(&mut self, frames: usize) -> Result<()> {
        let frames = frames.max(1);
        self.wait_idle()?;

        let old = std::mem::take(&mut self.slots);
        for slot in old {
            slot.destroy(self.ctx.device());
        }

        self.ctx.set_frames_in_flight(frames);
        self.slots = create_slots(&self.ctx, frames)?;
        self.current = 0;
        self.ctx.pipelines().recreate_pools(frames)?;
        self.ctx.retirement().lock().flush(self.ctx.device())?;

        tracing::info!(frames_in_flight = frames, "Frame slots rebuilt");
        Ok(())
    }

    fn observe_completions(&mut self) -> Result<()> {
        let device = self.ctx.device();
        for slot in &mut self.slots {
            if slot.state == SlotState::InFlight && device.fence_signaled(slot.fence)? {
                slot.state = SlotState::Idle;
            }
        }
        self.completed = self
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::InFlight)
            .map(|slot| slot.generation)
            .min()
            .map_or(self.next_generation - 1, |oldest| oldest - 1);
        Ok(())
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::warn!("Failed to wait for frames while dropping scheduler: {e}");
        }
        for slot in std::mem::take(&mut self.slots) {
            slot.destroy(self.ctx.device());
        }
        if let Err(e) = self.ctx.retirement().lock().flush(self.ctx.device()) {
            tracing::warn!("Failed to flush retired objects: {e}");
        }
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("frames_in_flight", &self.slots.len())
            .field("current", &self.current)
            .field("next_generation", &self.next_generation)
            .field("completed", &self.completed)
            .finish()
    }
}

fn create_slots(ctx: &Arc<RenderContext>, frames: usize) -> Result<Vec<FrameSlot>> {
    let mut slots = Vec::with_capacity(frames);
    for index in 0..frames.max(1) {
        match FrameSlot::new(ctx, index) {
            Ok(slot) => slots.push(slot),
            Err(e) => {
                for slot in slots {
                    slot.destroy(ctx.device());
                }
                return Err(e);
            }
        }
    }
    Ok(slots)
}

/// Recording session for one frame slot.
///
/// Several workloads may be recorded into one submission. Dropping the frame
/// without [`submit`](Self::submit) abandons it and returns the slot to idle.
pub struct Frame<'s> {
    scheduler: &'s mut FrameScheduler,
    slot: usize,
    staged: Vec<u64>,
    /// Workloads recorded so far.
    recorded: usize,
    submitted: bool,
}

impl Frame<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation this frame will be submitted as.
    pub fn generation(&self) -> u64 {
        self.scheduler.next_generation
    }

    /// The slot's staging buffer.
    pub fn staging(&self) -> &BufferAllocator {
        &self.scheduler.slots[self.slot].staging
    }

    /// Record one workload. Returns the offsets its buffer bindings were
    /// bound at.
    ///
    /// On failure nothing the workload staged stays reserved, and the frame
    /// can still be submitted with the workloads recorded before it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn record(&mut self, workload: &Workload<'_>) -> Result<Vec<u64>> {
        let _span = tracing::trace_span!("record", slot = self.slot).entered();
        let mark = self.staging().used_bytes();
        match self.record_commands(workload) {
            Ok((offsets, staged)) => {
                if staged {
                    self.staged.extend_from_slice(&offsets);
                }
                self.recorded += 1;
                Ok(offsets)
            }
            Err(e) => {
                self.scheduler.slots[self.slot].staging.truncate(mark);
                Err(e)
            }
        }
    }

    fn record_commands(&mut self, workload: &Workload<'_>) -> Result<(Vec<u64>, bool)> {
        let ctx = Arc::clone(&self.scheduler.ctx);
        let device = ctx.device();
        let limits = ctx.limits();

        let core = workload.core();
        let bind_point = core.bind_point();
        let layout = core.layout();
        let bindings = core.bindings();

        let push_constants = match (workload.push_constants, bindings.push_constants()) {
            (Some(data), Some(block)) => {
                if data.len() as u64 > u64::from(block.byte_size) {
                    return Err(GpuError::CapacityExceeded {
                        requested: data.len() as u64,
                        available: u64::from(block.byte_size),
                    });
                }
                Some((data, block.stages.to_vk()))
            }
            (Some(_), None) => {
                return Err(GpuError::InvalidState(format!(
                    "{} declares no push constant block",
                    core.name()
                )));
            }
            (None, _) => None,
        };

        if let BufferSource::Staged(blocks) = &workload.buffers {
            if blocks.len() > bindings.buffers().len() {
                return Err(GpuError::InvalidState(format!(
                    "{}: {} data blocks for {} buffer bindings",
                    core.name(),
                    blocks.len(),
                    bindings.buffers().len()
                )));
            }
            for (data, binding) in blocks.iter().zip(bindings.buffers()) {
                if data.len() as u64 > binding.byte_size {
                    return Err(GpuError::CapacityExceeded {
                        requested: data.len() as u64,
                        available: binding.byte_size,
                    });
                }
            }
        }

        let pipeline = workload.executable()?;
        let slot = &mut self.scheduler.slots[self.slot];

        if self.recorded > 0 {
            device.cmd_memory_barrier(slot.cmd, &MemoryBarrier::between_workloads());
        }
        if slot.last_bound != Some(pipeline) {
            device.cmd_bind_pipeline(slot.cmd, bind_point, pipeline);
            slot.last_bound = Some(pipeline);
        }

        let (buffer, offsets, staged) = match &workload.buffers {
            BufferSource::Staged(blocks) => {
                let mut offsets = Vec::with_capacity(bindings.buffers().len());
                for (index, binding) in bindings.buffers().iter().enumerate() {
                    let data = blocks.get(index).copied().unwrap_or_default();
                    let alignment = binding.offset_alignment(&limits);
                    offsets.push(slot.staging.stage_padded(data, binding.byte_size, alignment)?);
                }
                (&slot.staging, offsets, !bindings.buffers().is_empty())
            }
            BufferSource::External { buffer, offsets } => (*buffer, offsets.clone(), false),
        };

        if let Some(bound) = core.bind_set(self.slot, Some(buffer), &offsets, workload.images)? {
            device.cmd_bind_descriptor_set(
                slot.cmd,
                bind_point,
                layout,
                bound.set,
                &bound.dynamic_offsets,
            );
        }

        if let Some((data, stages)) = push_constants {
            device.cmd_push_constants(slot.cmd, layout, stages, data);
        }

        match &workload.work {
            Work::Dispatch { groups, .. } => device.cmd_dispatch(slot.cmd, *groups),
            Work::Draw {
                target,
                params,
                vertex_buffers,
                ..
            } => {
                device.cmd_begin_rendering(slot.cmd, target);
                if !vertex_buffers.is_empty() {
                    let (buffers, vb_offsets): (Vec<vk::Buffer>, Vec<u64>) =
                        vertex_buffers.iter().copied().unzip();
                    device.cmd_bind_vertex_buffers(slot.cmd, &buffers, &vb_offsets);
                }
                device.cmd_draw(slot.cmd, params);
                device.cmd_end_rendering(slot.cmd);
            }
        }

        Ok((offsets, staged))
    }

    /// Finish recording and submit. The scheduler advances to the next slot.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(mut self) -> Result<Submission> {
        let scheduler = &mut *self.scheduler;
        let device = scheduler.ctx.device();
        let slot = &mut scheduler.slots[self.slot];

        if self.recorded > 0 {
            device.cmd_memory_barrier(slot.cmd, &MemoryBarrier::before_host_read());
        }
        device.end_commands(slot.cmd)?;
        // On failure from here the frame is abandoned with the fence unsignaled;
        // the slot goes back to idle and never waits on it.
        device.reset_fence(slot.fence)?;
        device.submit(slot.cmd, slot.fence)?;

        let generation = scheduler.next_generation;
        slot.state = SlotState::InFlight;
        slot.generation = generation;
        let submission = Submission {
            slot: self.slot,
            generation,
            fence: slot.fence,
            staged: std::mem::take(&mut self.staged),
        };

        scheduler.next_generation += 1;
        scheduler
            .ctx
            .retirement()
            .lock()
            .set_generation(scheduler.next_generation);
        scheduler.current = (self.slot + 1) % scheduler.slots.len();
        self.submitted = true;

        tracing::trace!(slot = self.slot, generation, "Frame submitted");
        Ok(submission)
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if self.submitted {
            return;
        }
        let slot = &mut self.scheduler.slots[self.slot];
        slot.state = SlotState::Idle;
        slot.last_bound = None;
        tracing::debug!(slot = self.slot, "Frame abandoned before submission");
    }
}
