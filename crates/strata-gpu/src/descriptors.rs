//! Descriptor set pooling with identity-based reuse.
//!
//! Each pipeline owns one [`DescriptorSetPool`] per frame slot. A bind compares
//! the logical identities of the buffer and images against those recorded for
//! the current set; only a mismatch costs a descriptor write.

use crate::binding::BindingLayout;
use crate::buffer::BufferAllocator;
use crate::context::{RenderContext, ResourceId};
use crate::device::DescriptorWrite;
use crate::error::{GpuError, Result};
use crate::images::{ImageDescriptorInfo, ImageIdentity, ImageRegistry};
use crate::retire::Retired;
use ash::vk;
use std::sync::Arc;

/// Identity recorded for a buffer binding.
///
/// Dynamic bindings take their offset at bind time, so only the buffer
/// matters; static bindings bake the offset into the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferIdentity {
    id: ResourceId,
    static_offset: u64,
}

/// Cursor and recorded identities of one (pipeline, slot) pair.
#[derive(Debug, Default)]
struct SetCursor {
    index: Option<usize>,
    buffers: Vec<BufferIdentity>,
    images: Vec<ImageIdentity>,
}

impl SetCursor {
    fn matches(&self, buffers: &[BufferIdentity], images: &[ImageIdentity]) -> bool {
        self.index.is_some() && self.buffers == buffers && self.images == images
    }
}

/// Result of binding through a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSet {
    pub set: vk::DescriptorSet,
    /// Offsets for the dynamic buffer bindings, in binding-index order.
    pub dynamic_offsets: Vec<u32>,
    /// Whether descriptors were written for this bind.
    pub written: bool,
}

/// Growable pool of descriptor sets for one pipeline and frame slot.
pub struct DescriptorSetPool {
    ctx: Arc<RenderContext>,
    bindings: Arc<BindingLayout>,
    set_layout: vk::DescriptorSetLayout,
    slot: usize,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    cursor: SetCursor,
    writes: u64,
}

impl DescriptorSetPool {
    /// Create a pool holding `size` sets (at least one).
    pub fn new(
        ctx: Arc<RenderContext>,
        bindings: Arc<BindingLayout>,
        set_layout: vk::DescriptorSetLayout,
        slot: usize,
        size: u32,
    ) -> Result<Self> {
        let (pool, sets) = allocate_pool(&ctx, &bindings, set_layout, size.max(1))?;
        Ok(Self {
            ctx,
            bindings,
            set_layout,
            slot,
            pool,
            sets,
            cursor: SetCursor::default(),
            writes: 0,
        })
    }

    /// Frame slot this pool serves.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of sets in the current pool.
    pub fn pool_size(&self) -> usize {
        self.sets.len()
    }

    /// Index of the current set, if any bind happened since the last reset.
    pub fn cursor(&self) -> Option<usize> {
        self.cursor.index
    }

    /// Number of descriptor set writes performed over the pool's lifetime.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Rewind to the first set. Called once per slot reuse.
    pub fn reset_cursor(&mut self) {
        self.cursor = SetCursor::default();
    }

    /// Bind `buffer` at `offsets` (one per buffer binding) and the images the
    /// registry currently holds, writing a set only when an identity changed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn bind(
        &mut self,
        buffer: Option<&BufferAllocator>,
        offsets: &[u64],
        images: &dyn ImageRegistry,
    ) -> Result<BoundSet> {
        let bindings = Arc::clone(&self.bindings);
        let buffer_bindings = bindings.buffers();
        if offsets.len() != buffer_bindings.len() {
            return Err(GpuError::InvalidState(format!(
                "{} buffer offsets supplied for {} buffer bindings",
                offsets.len(),
                buffer_bindings.len()
            )));
        }

        let target = if buffer_bindings.is_empty() {
            None
        } else {
            let buffer = buffer.ok_or_else(|| {
                GpuError::InvalidState("buffer bindings declared but no buffer supplied".into())
            })?;
            let raw = buffer.raw().ok_or_else(|| {
                GpuError::InvalidState(format!("{} has no storage to bind", buffer.name()))
            })?;
            Some((buffer.id(), raw))
        };

        let mut buffer_ids = Vec::with_capacity(buffer_bindings.len());
        let mut dynamic_offsets = Vec::with_capacity(bindings.dynamic_count());
        if let Some((id, _)) = target {
            for (binding, &offset) in buffer_bindings.iter().zip(offsets) {
                if binding.dynamic_offset {
                    dynamic_offsets.push(u32::try_from(offset).map_err(|_| {
                        GpuError::InvalidState(format!(
                            "dynamic offset {offset} of binding {} exceeds 32 bits",
                            binding.index
                        ))
                    })?);
                }
                buffer_ids.push(BufferIdentity {
                    id,
                    static_offset: if binding.dynamic_offset { 0 } else { offset },
                });
            }
        }

        let mut image_infos: Vec<ImageDescriptorInfo> = Vec::with_capacity(bindings.images().len());
        for binding in bindings.images() {
            if binding.read_only_layout {
                images.request_read_only_layout(binding.slot);
            }
            let info = images.lookup(binding.slot).ok_or_else(|| {
                GpuError::ResourceNotFound(format!(
                    "image slot {} for binding {}",
                    binding.slot.0, binding.index
                ))
            })?;
            image_infos.push(info);
        }
        let image_ids: Vec<ImageIdentity> = image_infos.iter().map(ImageDescriptorInfo::identity).collect();

        if self.cursor.matches(&buffer_ids, &image_ids) {
            if let Some(index) = self.cursor.index {
                return Ok(BoundSet {
                    set: self.sets[index],
                    dynamic_offsets,
                    written: false,
                });
            }
        }

        let index = self.advance()?;
        let set = self.sets[index];

        let mut writes = Vec::with_capacity(buffer_bindings.len() + image_infos.len());
        if let Some((_, raw)) = target {
            for (binding, identity) in buffer_bindings.iter().zip(&buffer_ids) {
                writes.push(DescriptorWrite::Buffer {
                    binding: binding.index,
                    ty: binding.descriptor_type(),
                    buffer: raw,
                    offset: identity.static_offset,
                    range: binding.byte_size,
                });
            }
        }
        for (binding, info) in bindings.images().iter().zip(&image_infos) {
            writes.push(DescriptorWrite::Image {
                binding: binding.index,
                ty: binding.descriptor_type(),
                view: info.view,
                sampler: if binding.uses_sampler {
                    info.sampler
                } else {
                    vk::Sampler::null()
                },
                layout: info.layout,
            });
        }
        self.ctx.device().update_descriptor_set(set, &writes);
        self.writes += 1;

        self.cursor.buffers = buffer_ids;
        self.cursor.images = image_ids;

        Ok(BoundSet {
            set,
            dynamic_offsets,
            written: true,
        })
    }

    fn advance(&mut self) -> Result<usize> {
        let next = self.cursor.index.map_or(0, |index| index + 1);
        if next < self.sets.len() {
            self.cursor.index = Some(next);
            return Ok(next);
        }
        self.grow()?;
        self.cursor.index = Some(0);
        Ok(0)
    }

    // Sets already bound this frame live in the old pool, which is retired
    // rather than destroyed.
    fn grow(&mut self) -> Result<()> {
        let old_size = u32::try_from(self.sets.len()).unwrap_or(u32::MAX);
        let new_size = old_size.saturating_mul(2).max(1);
        let (pool, sets) = allocate_pool(&self.ctx, &self.bindings, self.set_layout, new_size)?;

        let old = std::mem::replace(&mut self.pool, pool);
        self.sets = sets;
        self.ctx.retire(Retired::DescriptorPool(old));

        tracing::debug!(slot = self.slot, old_size, new_size, "Descriptor pool grown");
        Ok(())
    }

    /// Retire the pool; its sets die with it once in-flight work completes.
    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for DescriptorSetPool {
    fn drop(&mut self) {
        if self.pool != vk::DescriptorPool::null() {
            let pool = std::mem::replace(&mut self.pool, vk::DescriptorPool::null());
            self.ctx.retire(Retired::DescriptorPool(pool));
        }
    }
}

impl std::fmt::Debug for DescriptorSetPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetPool")
            .field("slot", &self.slot)
            .field("pool_size", &self.sets.len())
            .field("cursor", &self.cursor.index)
            .field("writes", &self.writes)
            .finish()
    }
}

fn allocate_pool(
    ctx: &RenderContext,
    bindings: &BindingLayout,
    set_layout: vk::DescriptorSetLayout,
    size: u32,
) -> Result<(vk::DescriptorPool, Vec<vk::DescriptorSet>)> {
    let device = ctx.device();
    let pool = device.create_descriptor_pool(size, &bindings.pool_sizes(size))?;
    match device.allocate_descriptor_sets(pool, set_layout, size) {
        Ok(sets) => Ok((pool, sets)),
        Err(e) => {
            // Never handed out, so nothing can reference it.
            device.destroy_descriptor_pool(pool);
            Err(e)
        }
    }
}
