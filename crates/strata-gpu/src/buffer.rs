//! Growable linear buffer allocation.

use crate::context::{RenderContext, ResourceId};
use crate::device::{BufferDesc, DeviceBuffer, MemoryKind};
use crate::error::{GpuError, Result};
use crate::retire::Retired;
use ash::vk;
use std::sync::Arc;

/// One growable, linearly filled device buffer.
///
/// Writes append at `used_bytes`; [`reset`](Self::reset) rewinds once per frame.
/// When an append would not fit, [`ensure_capacity`](Self::ensure_capacity)
/// reallocates at `(capacity + additional) * 2` bytes and hands the old buffer
/// to the retirement queue. Host-visible buffers keep their written bytes
/// across growth; device-local buffers come back zero-content.
///
/// Not safe for concurrent mutation; owned by the submitting thread.
pub struct BufferAllocator {
    ctx: Arc<RenderContext>,
    name: String,
    usage: vk::BufferUsageFlags,
    memory: MemoryKind,
    buffer: Option<DeviceBuffer>,
    id: ResourceId,
    used: u64,
    last_write_offset: u64,
}

impl BufferAllocator {
    /// Create an allocator. Zero `initial_capacity` defers allocation to the
    /// first growth.
    pub fn new(
        ctx: Arc<RenderContext>,
        name: impl Into<String>,
        usage: vk::BufferUsageFlags,
        memory: MemoryKind,
        initial_capacity: u64,
    ) -> Result<Self> {
        let id = ctx.next_resource_id();
        let mut allocator = Self {
            ctx,
            name: name.into(),
            usage,
            memory,
            buffer: None,
            id,
            used: 0,
            last_write_offset: 0,
        };
        if initial_capacity > 0 {
            allocator.buffer = Some(allocator.allocate(initial_capacity)?);
        }
        Ok(allocator)
    }

    fn allocate(&self, size: u64) -> Result<DeviceBuffer> {
        self.ctx.device().create_buffer(&BufferDesc {
            size,
            usage: self.usage,
            memory: self.memory,
            name: &self.name,
        })
    }

    /// Logical identity; changes whenever the backing buffer is replaced.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn capacity(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.size)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    /// Offset of the most recent append.
    pub fn last_write_offset(&self) -> u64 {
        self.last_write_offset
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.memory
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing buffer handle, if anything has been allocated yet.
    pub fn raw(&self) -> Option<vk::Buffer> {
        self.buffer.as_ref().map(|b| b.buffer)
    }

    /// Grow so that `additional` more bytes fit after `used_bytes`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn ensure_capacity(&mut self, additional: u64) -> Result<()> {
        let capacity = self.capacity();
        if additional <= capacity - self.used {
            return Ok(());
        }

        let new_size = capacity
            .checked_add(additional)
            .and_then(|size| size.checked_mul(2))
            .ok_or_else(|| {
                GpuError::AllocationFailed(format!(
                    "{}: growth by {additional} bytes overflows",
                    self.name
                ))
            })?;
        let replacement = self.allocate(new_size)?;

        if let Some(old) = self.buffer.take() {
            if let (Some(src), Some(dst)) = (old.mapped, replacement.mapped) {
                // SAFETY: both mappings cover at least `used` bytes and belong
                // to distinct allocations.
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), self.used as usize);
                }
            }
            self.ctx.retire(Retired::Buffer(old));
        }

        tracing::debug!(
            buffer = %self.name,
            old_capacity = capacity,
            new_capacity = new_size,
            used = self.used,
            "Buffer grown"
        );

        self.buffer = Some(replacement);
        self.id = self.ctx.next_resource_id();
        Ok(())
    }

    /// Write `data` at `used_bytes` and return the offset it landed at.
    ///
    /// The data must fit the remaining capacity; call
    /// [`ensure_capacity`](Self::ensure_capacity) first.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.used;
        if data.is_empty() {
            self.last_write_offset = offset;
            return Ok(offset);
        }

        let available = self.capacity() - self.used;
        let len = data.len() as u64;
        if len > available {
            return Err(GpuError::CapacityExceeded {
                requested: len,
                available,
            });
        }

        let ptr = self.pointer().ok_or_else(|| {
            GpuError::InvalidState(format!("{} is not host-visible", self.name))
        })?;
        // SAFETY: `ptr` is the mapped base plus `used`, and `len` bytes fit.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }

        self.last_write_offset = offset;
        self.used += len;
        Ok(offset)
    }

    /// Append a slice of plain-old-data values.
    pub fn append_pod<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<u64> {
        self.append(bytemuck::cast_slice(data))
    }

    /// Rewind to an empty buffer. Capacity and identity are kept.
    pub fn reset(&mut self) {
        self.used = 0;
        self.last_write_offset = 0;
    }

    /// Discard everything written at or after `offset`. Capacity and
    /// identity are kept; offsets past `used_bytes` are ignored.
    pub fn truncate(&mut self, offset: u64) {
        if offset < self.used {
            self.used = offset;
            self.last_write_offset = self.last_write_offset.min(offset);
        }
    }

    /// Host address of the next write, for mappable buffers.
    pub fn pointer(&self) -> Option<*mut u8> {
        let mapped = self.buffer.as_ref()?.mapped?;
        // SAFETY: `used <= capacity`, so this stays within (or one past) the mapping.
        Some(unsafe { mapped.as_ptr().add(self.used as usize) })
    }

    /// Pad `used_bytes` up to a multiple of `alignment`, growing if needed.
    pub fn align_to(&mut self, alignment: u64) -> Result<()> {
        let aligned = align_up(self.used, alignment);
        let padding = aligned - self.used;
        if padding > 0 {
            self.ensure_capacity(padding)?;
            self.used = aligned;
        }
        Ok(())
    }

    /// Align, grow and append in one step. Returns the offset of `data`.
    pub fn stage(&mut self, data: &[u8], alignment: u64) -> Result<u64> {
        self.stage_padded(data, data.len() as u64, alignment)
    }

    /// Like [`stage`](Self::stage), but reserve at least `block_size` bytes so
    /// a binding of that size addressed at the returned offset stays in range.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn stage_padded(&mut self, data: &[u8], block_size: u64, alignment: u64) -> Result<u64> {
        let reserve = block_size.max(data.len() as u64);
        self.align_to(alignment)?;
        self.ensure_capacity(reserve)?;
        let offset = self.append(data)?;
        self.used = offset + reserve;
        Ok(offset)
    }

    /// Copy `len` bytes at `offset` out of a mappable buffer.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState(format!("{} has no storage", self.name)))?;
        let mapped = buffer.mapped.ok_or_else(|| {
            GpuError::InvalidState(format!("{} is not host-visible", self.name))
        })?;

        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > buffer.size {
            return Err(GpuError::CapacityExceeded {
                requested: end,
                available: buffer.size,
            });
        }

        let mut out = vec![0u8; len];
        // SAFETY: `offset..end` lies within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr().add(offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        // May still be referenced by in-flight work.
        if let Some(buffer) = self.buffer.take() {
            self.ctx.retire(Retired::Buffer(buffer));
        }
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("memory", &self.memory)
            .finish()
    }
}

/// Round `value` up to a multiple of `alignment` (zero or one means none).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}
