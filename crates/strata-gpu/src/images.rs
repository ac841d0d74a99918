//! Image/texture registry contract.

use crate::context::ResourceId;
use ash::vk;

/// Logical image-slot identifier, resolved by an [`ImageRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageSlot(pub u32);

/// Current state of an image slot.
///
/// `view_id` and `sampler_id` are the logical identities used for descriptor
/// reuse; the registry must assign a fresh id whenever the underlying view or
/// sampler object is recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptorInfo {
    pub view: vk::ImageView,
    pub view_id: ResourceId,
    pub sampler: vk::Sampler,
    pub sampler_id: ResourceId,
    pub layout: vk::ImageLayout,
}

/// Identity pair recorded for an image binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageIdentity {
    pub view: ResourceId,
    pub sampler: ResourceId,
}

impl ImageDescriptorInfo {
    pub fn identity(&self) -> ImageIdentity {
        ImageIdentity {
            view: self.view_id,
            sampler: self.sampler_id,
        }
    }
}

/// Lookup of the images currently assigned to logical slots.
pub trait ImageRegistry {
    /// Current (view, sampler, layout) for `slot`, if anything is bound there.
    fn lookup(&self, slot: ImageSlot) -> Option<ImageDescriptorInfo>;

    /// Ask the owner of `slot` to move its image into a shader-read-only layout.
    fn request_read_only_layout(&self, _slot: ImageSlot) {}
}

/// Registry with no images, for pipelines without image bindings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImages;

impl ImageRegistry for NoImages {
    fn lookup(&self, _slot: ImageSlot) -> Option<ImageDescriptorInfo> {
        None
    }
}
