//! Generation-keyed deferred destruction.
//!
//! Objects replaced by growth or torn down while a frame may still reference
//! them cannot be destroyed right away. They are queued with the generation of
//! the submission being recorded at the time and destroyed once every
//! submission up to and including that generation has been observed complete.

use crate::device::{DeviceBuffer, GpuDevice};
use crate::error::Result;
use ash::vk;
use std::collections::VecDeque;

/// A device object awaiting destruction.
#[derive(Debug)]
pub enum Retired {
    Buffer(DeviceBuffer),
    DescriptorPool(vk::DescriptorPool),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    DescriptorSetLayout(vk::DescriptorSetLayout),
}

impl Retired {
    fn destroy(self, device: &dyn GpuDevice) -> Result<()> {
        match self {
            Self::Buffer(buffer) => device.destroy_buffer(&buffer)?,
            Self::DescriptorPool(pool) => device.destroy_descriptor_pool(pool),
            Self::Pipeline(pipeline) => device.destroy_pipeline(pipeline),
            Self::PipelineLayout(layout) => device.destroy_pipeline_layout(layout),
            Self::DescriptorSetLayout(layout) => device.destroy_descriptor_set_layout(layout),
        }
        Ok(())
    }
}

/// An object pending destruction.
#[derive(Debug)]
struct PendingRetirement {
    object: Retired,
    /// Generation of the submission being recorded when it was retired.
    generation: u64,
}

/// Queue of retired objects.
#[derive(Debug)]
pub struct RetirementQueue {
    pending: VecDeque<PendingRetirement>,
    /// Generation of the submission currently (or next) being recorded.
    generation: u64,
}

impl Default for RetirementQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RetirementQueue {
    /// Create an empty queue. Submission generations start at 1.
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            generation: 1,
        }
    }

    /// Queue an object for destruction once the current generation completes.
    pub fn retire(&mut self, object: Retired) {
        tracing::debug!(generation = self.generation, ?object, "Retiring GPU object");
        self.pending.push_back(PendingRetirement {
            object,
            generation: self.generation,
        });
    }

    /// Set the generation of the submission being recorded.
    ///
    /// Generations must not decrease.
    pub fn set_generation(&mut self, generation: u64) {
        debug_assert!(generation >= self.generation);
        self.generation = generation;
    }

    /// Generation new retirements are tagged with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Destroy every object whose generation is at most `completed`.
    ///
    /// `completed` is the highest generation such that it and every earlier
    /// submission have been observed complete. Returns the number destroyed.
    pub fn collect(&mut self, device: &dyn GpuDevice, completed: u64) -> Result<usize> {
        let mut destroyed = 0;
        // Generations are non-decreasing along the queue, so only the front can mature.
        while matches!(self.pending.front(), Some(p) if p.generation <= completed) {
            if let Some(pending) = self.pending.pop_front() {
                pending.object.destroy(device)?;
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            tracing::debug!(destroyed, completed, "Collected retired GPU objects");
        }
        Ok(destroyed)
    }

    /// Destroy everything immediately.
    ///
    /// Only valid once the device is idle.
    pub fn flush(&mut self, device: &dyn GpuDevice) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            pending.object.destroy(device)?;
        }
        Ok(())
    }

    /// Number of objects awaiting destruction.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
