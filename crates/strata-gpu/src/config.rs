//! Orchestrator configuration.

use ash::vk;

/// Configuration supplied by the host renderer.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of frame slots (maximum submissions in flight).
    pub frames_in_flight: usize,
    /// Initial capacity of each slot's staging buffer, in bytes.
    pub staging_capacity: u64,
    /// Usage flags of the staging buffers.
    pub staging_usage: vk::BufferUsageFlags,
    /// Number of descriptor sets a fresh per-slot pool starts with.
    pub initial_descriptor_sets: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            staging_capacity: 64 * 1024,
            staging_usage: vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER,
            initial_descriptor_sets: 1,
        }
    }
}

impl OrchestratorConfig {
    /// Create a config with the given frame parallelism.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight,
            ..Default::default()
        }
    }

    /// Set the frame parallelism.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the initial staging capacity per slot.
    pub fn with_staging_capacity(mut self, bytes: u64) -> Self {
        self.staging_capacity = bytes;
        self
    }

    /// Set the staging buffer usage flags.
    pub fn with_staging_usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.staging_usage = usage;
        self
    }

    /// Set the initial descriptor pool size.
    pub fn with_initial_descriptor_sets(mut self, sets: u32) -> Self {
        self.initial_descriptor_sets = sets;
        self
    }

    /// Frame parallelism, never less than one.
    pub(crate) fn slot_count(&self) -> usize {
        self.frames_in_flight.max(1)
    }
}
