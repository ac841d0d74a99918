//! Shared rendering context.

use crate::config::OrchestratorConfig;
use crate::device::{DeviceLimits, GpuDevice};
use crate::registry::PipelineRegistry;
use crate::retire::{Retired, RetirementQueue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Logical identity of a GPU-visible resource.
///
/// Assigned on creation and again on every reallocation; descriptor reuse
/// compares these, never contents or raw handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// State shared by every orchestration component.
///
/// Owns the device handle, the retirement queue, the pipeline registry and
/// the identity source. Components hold it through an `Arc`.
pub struct RenderContext {
    device: Arc<dyn GpuDevice>,
    limits: DeviceLimits,
    config: OrchestratorConfig,
    frames_in_flight: AtomicUsize,
    retirement: Mutex<RetirementQueue>,
    pipelines: PipelineRegistry,
    next_id: AtomicU64,
}

impl RenderContext {
    /// Create a context over `device`.
    pub fn new(device: Arc<dyn GpuDevice>, config: OrchestratorConfig) -> Arc<Self> {
        let limits = device.limits();
        let frames = config.slot_count();
        tracing::info!(
            frames_in_flight = frames,
            staging_capacity = config.staging_capacity,
            "Render context created"
        );
        Arc::new(Self {
            device,
            limits,
            config,
            frames_in_flight: AtomicUsize::new(frames),
            retirement: Mutex::new(RetirementQueue::new()),
            pipelines: PipelineRegistry::default(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    /// Configuration the context was created with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Current number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn set_frames_in_flight(&self, frames: usize) {
        self.frames_in_flight.store(frames.max(1), Ordering::Release);
    }

    /// Allocate a fresh logical identity.
    pub fn next_resource_id(&self) -> ResourceId {
        ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Hand an object to the retirement queue.
    pub fn retire(&self, object: Retired) {
        self.retirement.lock().retire(object);
    }

    pub fn retirement(&self) -> &Mutex<RetirementQueue> {
        &self.retirement
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        let queue = self.retirement.get_mut();
        if queue.pending_count() == 0 {
            return;
        }
        if let Err(e) = self.device.wait_idle() {
            tracing::warn!("Device wait failed while dropping render context: {e}");
        }
        if let Err(e) = queue.flush(self.device.as_ref()) {
            tracing::warn!("Failed to flush retired objects: {e}");
        }
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("limits", &self.limits)
            .field("frames_in_flight", &self.frames_in_flight())
            .field("pipelines", &self.pipelines)
            .finish_non_exhaustive()
    }
}
