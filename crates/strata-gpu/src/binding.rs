//! Descriptor binding declarations.
//!
//! Binding declarations arrive as a closed set of variants built directly by
//! the host; [`BindingLayout`] validates them and derives everything the
//! layout, pool and bind paths need.

use crate::device::DeviceLimits;
use crate::error::{GpuError, Result};
use crate::images::ImageSlot;
use crate::shader::ShaderStages;
use ash::vk;

/// Kind of buffer a binding exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Uniform,
    Storage,
}

/// A buffer made visible to shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub index: u32,
    pub stages: ShaderStages,
    pub byte_size: u64,
    /// Bound with a per-bind dynamic offset instead of a baked offset.
    pub dynamic_offset: bool,
    pub kind: BufferKind,
}

impl BufferBinding {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match (self.kind, self.dynamic_offset) {
            (BufferKind::Uniform, true) => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            (BufferKind::Uniform, false) => vk::DescriptorType::UNIFORM_BUFFER,
            (BufferKind::Storage, true) => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            (BufferKind::Storage, false) => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    /// Offset alignment the device demands for this binding.
    pub fn offset_alignment(&self, limits: &DeviceLimits) -> u64 {
        match self.kind {
            BufferKind::Uniform => limits.min_uniform_offset_alignment,
            BufferKind::Storage => limits.min_storage_offset_alignment,
        }
    }
}

/// An image (optionally with sampler) made visible to shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    pub index: u32,
    pub stages: ShaderStages,
    pub uses_sampler: bool,
    /// Ask the image's owner for a shader-read-only layout on bind.
    pub read_only_layout: bool,
    pub slot: ImageSlot,
}

impl ImageBinding {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        if self.uses_sampler {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        } else {
            vk::DescriptorType::STORAGE_IMAGE
        }
    }
}

/// Push constant block passed with each dispatch or draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantBlock {
    pub byte_size: u32,
    pub stages: ShaderStages,
}

impl PushConstantBlock {
    pub fn range(&self) -> vk::PushConstantRange {
        vk::PushConstantRange::default()
            .stage_flags(self.stages.to_vk())
            .offset(0)
            .size(self.byte_size)
    }
}

/// One binding declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorBinding {
    Buffer(BufferBinding),
    Image(ImageBinding),
    PushConstants(PushConstantBlock),
}

impl DescriptorBinding {
    /// Dynamic uniform buffer binding.
    pub fn uniform(index: u32, stages: ShaderStages, byte_size: u64) -> Self {
        Self::Buffer(BufferBinding {
            index,
            stages,
            byte_size,
            dynamic_offset: true,
            kind: BufferKind::Uniform,
        })
    }

    /// Dynamic storage buffer binding.
    pub fn storage(index: u32, stages: ShaderStages, byte_size: u64) -> Self {
        Self::Buffer(BufferBinding {
            index,
            stages,
            byte_size,
            dynamic_offset: true,
            kind: BufferKind::Storage,
        })
    }

    /// Combined image sampler read in a shader-read-only layout.
    pub fn sampled_image(index: u32, stages: ShaderStages, slot: ImageSlot) -> Self {
        Self::Image(ImageBinding {
            index,
            stages,
            uses_sampler: true,
            read_only_layout: true,
            slot,
        })
    }

    /// Storage image without sampler.
    pub fn storage_image(index: u32, stages: ShaderStages, slot: ImageSlot) -> Self {
        Self::Image(ImageBinding {
            index,
            stages,
            uses_sampler: false,
            read_only_layout: false,
            slot,
        })
    }

    pub fn push_constants(byte_size: u32, stages: ShaderStages) -> Self {
        Self::PushConstants(PushConstantBlock { byte_size, stages })
    }
}

/// Validated, partitioned binding declarations of one pipeline.
///
/// Buffer and image bindings are kept sorted by binding index, which is also
/// the order dynamic offsets are supplied in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingLayout {
    buffers: Vec<BufferBinding>,
    images: Vec<ImageBinding>,
    push_constants: Option<PushConstantBlock>,
}

impl BindingLayout {
    /// Validate and partition an ordered declaration list.
    pub fn new(bindings: &[DescriptorBinding]) -> Result<Self> {
        let mut layout = Self::default();

        for binding in bindings {
            match *binding {
                DescriptorBinding::Buffer(buffer) => {
                    if buffer.byte_size == 0 {
                        return Err(GpuError::InvalidState(format!(
                            "buffer binding {} has zero size",
                            buffer.index
                        )));
                    }
                    layout.buffers.push(buffer);
                }
                DescriptorBinding::Image(image) => layout.images.push(image),
                DescriptorBinding::PushConstants(block) => {
                    if layout.push_constants.replace(block).is_some() {
                        return Err(GpuError::InvalidState(
                            "more than one push constant block declared".to_string(),
                        ));
                    }
                }
            }
        }

        let mut indices: Vec<u32> = layout
            .buffers
            .iter()
            .map(|b| b.index)
            .chain(layout.images.iter().map(|i| i.index))
            .collect();
        indices.sort_unstable();
        if let Some(pair) = indices.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(GpuError::InvalidState(format!(
                "binding index {} declared twice",
                pair[0]
            )));
        }

        layout.buffers.sort_by_key(|b| b.index);
        layout.images.sort_by_key(|i| i.index);
        Ok(layout)
    }

    pub fn buffers(&self) -> &[BufferBinding] {
        &self.buffers
    }

    pub fn images(&self) -> &[ImageBinding] {
        &self.images
    }

    pub fn push_constants(&self) -> Option<PushConstantBlock> {
        self.push_constants
    }

    /// Number of buffer bindings taking a dynamic offset.
    pub fn dynamic_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.dynamic_offset).count()
    }

    /// Vulkan layout bindings for the descriptor set layout.
    pub fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        let buffers = self.buffers.iter().map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.index)
                .descriptor_type(b.descriptor_type())
                .descriptor_count(1)
                .stage_flags(b.stages.to_vk())
        });
        let images = self.images.iter().map(|i| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(i.index)
                .descriptor_type(i.descriptor_type())
                .descriptor_count(1)
                .stage_flags(i.stages.to_vk())
        });
        buffers.chain(images).collect()
    }

    /// Pool sizes able to hold `sets` complete descriptor sets.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        let types = self
            .buffers
            .iter()
            .map(BufferBinding::descriptor_type)
            .chain(self.images.iter().map(ImageBinding::descriptor_type));

        for ty in types {
            match sizes.iter_mut().find(|size| size.ty == ty) {
                Some(size) => size.descriptor_count += sets,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: sets,
                }),
            }
        }
        sizes
    }
}
