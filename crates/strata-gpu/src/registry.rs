//! Registry of live pipelines.
//!
//! The scheduler needs to reach every pipeline's per-slot descriptor state at
//! frame start and when the number of frames in flight changes. Pipelines
//! register themselves on construction and unregister on teardown; the
//! registry only holds weak references.

use crate::context::ResourceId;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Per-slot descriptor state a registered pipeline exposes to the scheduler.
pub(crate) trait SlotPools: Send + Sync {
    /// Rewind the descriptor cursor of `slot`.
    fn reset_cursor(&self, slot: usize);

    /// Replace every per-slot pool with `frames` fresh ones.
    fn recreate_pools(&self, frames: usize) -> Result<()>;
}

/// Explicit registry of live pipelines, owned by the render context.
#[derive(Default)]
pub struct PipelineRegistry {
    entries: Mutex<Vec<(ResourceId, Weak<dyn SlotPools>)>>,
}

impl PipelineRegistry {
    pub(crate) fn register(&self, id: ResourceId, pipeline: Weak<dyn SlotPools>) {
        self.entries.lock().push((id, pipeline));
    }

    pub(crate) fn unregister(&self, id: ResourceId) {
        self.entries.lock().retain(|(entry, _)| *entry != id);
    }

    /// Number of registered pipelines.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a pipeline with `id` is registered.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.entries.lock().iter().any(|(entry, _)| *entry == id)
    }

    /// Rewind every pipeline's cursor for `slot`.
    pub fn reset_cursors(&self, slot: usize) {
        for pipeline in self.live() {
            pipeline.reset_cursor(slot);
        }
    }

    /// Rebuild every pipeline's per-slot pools for `frames` slots.
    pub fn recreate_pools(&self, frames: usize) -> Result<()> {
        let live = self.live();
        tracing::info!(pipelines = live.len(), frames, "Recreating descriptor pools");
        for pipeline in live {
            pipeline.recreate_pools(frames)?;
        }
        Ok(())
    }

    // Upgraded outside of the callbacks so a pipeline dropped meanwhile can
    // unregister without contending on the entries lock.
    fn live(&self) -> Vec<Arc<dyn SlotPools>> {
        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("len", &self.len())
            .finish()
    }
}
