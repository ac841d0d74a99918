//! Fixed-function render state keys for graphics pipelines.
//!
//! A [`PipelineStateKey`] packs every fixed-function setting that selects a
//! distinct executable into one `u64`, next to the render-target formats.
//! Only core Vulkan enum values are representable; the setters reject
//! extension values instead of folding them into another key.

use crate::error::{GpuError, Result};
use ash::vk;

const TOPOLOGY: Field = Field::new(0, 4);
const POLYGON_MODE: Field = Field::new(4, 2);
const CULL_MODE: Field = Field::new(6, 2);
const DEPTH_TEST: Field = Field::new(8, 1);
const DEPTH_WRITE: Field = Field::new(9, 1);
const DEPTH_COMPARE: Field = Field::new(10, 3);
const BLEND_ENABLE: Field = Field::new(13, 1);
const SRC_COLOR: Field = Field::new(14, 5);
const DST_COLOR: Field = Field::new(19, 5);
const SRC_ALPHA: Field = Field::new(24, 5);
const DST_ALPHA: Field = Field::new(29, 5);
const COLOR_MASK: Field = Field::new(34, 4);
const LOGIC_ENABLE: Field = Field::new(38, 1);
const LOGIC_OP: Field = Field::new(39, 4);

#[derive(Clone, Copy)]
struct Field {
    shift: u32,
    mask: u64,
}

impl Field {
    const fn new(shift: u32, width: u32) -> Self {
        Self {
            shift,
            mask: (1 << width) - 1,
        }
    }

    fn get(self, bits: u64) -> u64 {
        (bits >> self.shift) & self.mask
    }

    fn put(self, bits: u64, value: u64) -> u64 {
        (bits & !(self.mask << self.shift)) | ((value & self.mask) << self.shift)
    }

    /// Store `raw`, rejecting values outside the field.
    fn set(self, bits: u64, what: &str, raw: i64) -> Result<u64> {
        match u64::try_from(raw) {
            Ok(value) if value <= self.mask => Ok(self.put(bits, value)),
            _ => Err(GpuError::InvalidState(format!(
                "{what} {raw} is not a core Vulkan value"
            ))),
        }
    }
}

/// Attachment formats a graphics pipeline renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetFormats {
    pub color: vk::Format,
    pub depth: Option<vk::Format>,
}

impl Default for RenderTargetFormats {
    fn default() -> Self {
        Self {
            color: vk::Format::B8G8R8A8_SRGB,
            depth: Some(vk::Format::D32_SFLOAT),
        }
    }
}

/// Blend factors for color and alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendFactors {
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
}

impl BlendFactors {
    /// Conventional non-premultiplied alpha blending.
    pub fn alpha() -> Self {
        Self {
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        }
    }
}

/// Key selecting one compiled graphics pipeline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineStateKey {
    bits: u64,
    targets: RenderTargetFormats,
}

impl Default for PipelineStateKey {
    fn default() -> Self {
        Self::new(RenderTargetFormats::default())
    }
}

impl PipelineStateKey {
    /// Opaque triangles with depth test and write, back-face culling.
    pub fn new(targets: RenderTargetFormats) -> Self {
        let mut bits = 0;
        bits = TOPOLOGY.put(bits, core_raw(vk::PrimitiveTopology::TRIANGLE_LIST.as_raw()));
        bits = POLYGON_MODE.put(bits, core_raw(vk::PolygonMode::FILL.as_raw()));
        bits = CULL_MODE.put(bits, u64::from(vk::CullModeFlags::BACK.as_raw()));
        bits = DEPTH_TEST.put(bits, 1);
        bits = DEPTH_WRITE.put(bits, 1);
        bits = DEPTH_COMPARE.put(bits, core_raw(vk::CompareOp::LESS.as_raw()));
        bits = COLOR_MASK.put(bits, u64::from(vk::ColorComponentFlags::RGBA.as_raw()));
        Self { bits, targets }
    }

    /// The packed fixed-function bits, without render-target formats.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Result<Self> {
        self.bits = TOPOLOGY.set(self.bits, "topology", i64::from(topology.as_raw()))?;
        Ok(self)
    }

    pub fn with_polygon_mode(mut self, mode: vk::PolygonMode) -> Result<Self> {
        self.bits = POLYGON_MODE.set(self.bits, "polygon mode", i64::from(mode.as_raw()))?;
        Ok(self)
    }

    pub fn with_cull_mode(mut self, mode: vk::CullModeFlags) -> Result<Self> {
        self.bits = CULL_MODE.set(self.bits, "cull mode", i64::from(mode.as_raw()))?;
        Ok(self)
    }

    pub fn with_depth(mut self, test: bool, write: bool, compare: vk::CompareOp) -> Result<Self> {
        self.bits = DEPTH_COMPARE.set(self.bits, "compare op", i64::from(compare.as_raw()))?;
        self.bits = DEPTH_TEST.put(self.bits, u64::from(test));
        self.bits = DEPTH_WRITE.put(self.bits, u64::from(write));
        Ok(self)
    }

    /// Enable blending with `factors`, or disable it with `None`.
    pub fn with_blend(mut self, factors: Option<BlendFactors>) -> Result<Self> {
        let enabled = factors.is_some();
        let factors = factors.unwrap_or(BlendFactors {
            src_color: vk::BlendFactor::ZERO,
            dst_color: vk::BlendFactor::ZERO,
            src_alpha: vk::BlendFactor::ZERO,
            dst_alpha: vk::BlendFactor::ZERO,
        });
        let mut bits = self.bits;
        for (field, factor) in [
            (SRC_COLOR, factors.src_color),
            (DST_COLOR, factors.dst_color),
            (SRC_ALPHA, factors.src_alpha),
            (DST_ALPHA, factors.dst_alpha),
        ] {
            bits = field.set(bits, "blend factor", i64::from(factor.as_raw()))?;
        }
        self.bits = BLEND_ENABLE.put(bits, u64::from(enabled));
        Ok(self)
    }

    pub fn with_color_write_mask(mut self, mask: vk::ColorComponentFlags) -> Result<Self> {
        self.bits = COLOR_MASK.set(self.bits, "color write mask", i64::from(mask.as_raw()))?;
        Ok(self)
    }

    /// Enable a logic op, or disable it with `None`.
    pub fn with_logic_op(mut self, op: Option<vk::LogicOp>) -> Result<Self> {
        let raw = op.map_or(0, vk::LogicOp::as_raw);
        self.bits = LOGIC_OP.set(self.bits, "logic op", i64::from(raw))?;
        self.bits = LOGIC_ENABLE.put(self.bits, u64::from(op.is_some()));
        Ok(self)
    }

    pub fn with_render_targets(mut self, targets: RenderTargetFormats) -> Self {
        self.targets = targets;
        self
    }

    pub fn topology(&self) -> vk::PrimitiveTopology {
        vk::PrimitiveTopology::from_raw(field_i32(TOPOLOGY, self.bits))
    }

    pub fn polygon_mode(&self) -> vk::PolygonMode {
        vk::PolygonMode::from_raw(field_i32(POLYGON_MODE, self.bits))
    }

    pub fn cull_mode(&self) -> vk::CullModeFlags {
        vk::CullModeFlags::from_raw(field_u32(CULL_MODE, self.bits))
    }

    pub fn depth_test(&self) -> bool {
        DEPTH_TEST.get(self.bits) != 0
    }

    pub fn depth_write(&self) -> bool {
        DEPTH_WRITE.get(self.bits) != 0
    }

    pub fn depth_compare(&self) -> vk::CompareOp {
        vk::CompareOp::from_raw(field_i32(DEPTH_COMPARE, self.bits))
    }

    /// Blend factors, if blending is enabled.
    pub fn blend(&self) -> Option<BlendFactors> {
        (BLEND_ENABLE.get(self.bits) != 0).then(|| BlendFactors {
            src_color: vk::BlendFactor::from_raw(field_i32(SRC_COLOR, self.bits)),
            dst_color: vk::BlendFactor::from_raw(field_i32(DST_COLOR, self.bits)),
            src_alpha: vk::BlendFactor::from_raw(field_i32(SRC_ALPHA, self.bits)),
            dst_alpha: vk::BlendFactor::from_raw(field_i32(DST_ALPHA, self.bits)),
        })
    }

    pub fn color_write_mask(&self) -> vk::ColorComponentFlags {
        vk::ColorComponentFlags::from_raw(field_u32(COLOR_MASK, self.bits))
    }

    pub fn logic_op(&self) -> Option<vk::LogicOp> {
        (LOGIC_ENABLE.get(self.bits) != 0)
            .then(|| vk::LogicOp::from_raw(field_i32(LOGIC_OP, self.bits)))
    }

    pub fn render_targets(&self) -> RenderTargetFormats {
        self.targets
    }
}

// Core enum values are non-negative.
fn core_raw(raw: i32) -> u64 {
    u64::from(raw.unsigned_abs())
}

fn field_i32(field: Field, bits: u64) -> i32 {
    // Fields are at most 5 bits wide.
    field.get(bits) as i32
}

fn field_u32(field: Field, bits: u64) -> u32 {
    field.get(bits) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_state_decodes() {
        let key = PipelineStateKey::default();
        assert_eq!(key.topology(), vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(key.polygon_mode(), vk::PolygonMode::FILL);
        assert_eq!(key.cull_mode(), vk::CullModeFlags::BACK);
        assert!(key.depth_test());
        assert!(key.depth_write());
        assert_eq!(key.depth_compare(), vk::CompareOp::LESS);
        assert_eq!(key.blend(), None);
        assert_eq!(key.color_write_mask(), vk::ColorComponentFlags::RGBA);
        assert_eq!(key.logic_op(), None);
    }

    #[test]
    fn fields_do_not_overlap() -> Result<()> {
        let key = PipelineStateKey::default()
            .with_topology(vk::PrimitiveTopology::PATCH_LIST)?
            .with_polygon_mode(vk::PolygonMode::POINT)?
            .with_cull_mode(vk::CullModeFlags::FRONT_AND_BACK)?
            .with_depth(false, true, vk::CompareOp::ALWAYS)?
            .with_blend(Some(BlendFactors {
                src_color: vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
                dst_color: vk::BlendFactor::SRC_ALPHA_SATURATE,
                src_alpha: vk::BlendFactor::ONE,
                dst_alpha: vk::BlendFactor::ZERO,
            }))?
            .with_color_write_mask(vk::ColorComponentFlags::R | vk::ColorComponentFlags::A)?
            .with_logic_op(Some(vk::LogicOp::SET))?;

        assert_eq!(key.topology(), vk::PrimitiveTopology::PATCH_LIST);
        assert_eq!(key.polygon_mode(), vk::PolygonMode::POINT);
        assert_eq!(key.cull_mode(), vk::CullModeFlags::FRONT_AND_BACK);
        assert!(!key.depth_test());
        assert!(key.depth_write());
        assert_eq!(key.depth_compare(), vk::CompareOp::ALWAYS);
        let blend = key.blend().unwrap();
        assert_eq!(blend.src_color, vk::BlendFactor::ONE_MINUS_SRC1_ALPHA);
        assert_eq!(blend.dst_color, vk::BlendFactor::SRC_ALPHA_SATURATE);
        assert_eq!(blend.src_alpha, vk::BlendFactor::ONE);
        assert_eq!(blend.dst_alpha, vk::BlendFactor::ZERO);
        assert_eq!(
            key.color_write_mask(),
            vk::ColorComponentFlags::R | vk::ColorComponentFlags::A
        );
        assert_eq!(key.logic_op(), Some(vk::LogicOp::SET));
        Ok(())
    }

    #[test]
    fn extension_values_are_rejected() {
        let key = PipelineStateKey::default();
        assert!(matches!(
            key.with_polygon_mode(vk::PolygonMode::FILL_RECTANGLE_NV),
            Err(GpuError::InvalidState(_))
        ));
        assert!(key
            .with_blend(Some(BlendFactors {
                src_color: vk::BlendFactor::CONSTANT_COLOR,
                dst_color: vk::BlendFactor::from_raw(-1),
                src_alpha: vk::BlendFactor::ONE,
                dst_alpha: vk::BlendFactor::ZERO,
            }))
            .is_err());
        assert!(key.with_cull_mode(vk::CullModeFlags::from_raw(0b100)).is_err());

        // A rejected setter leaves the caller's key usable and unchanged.
        assert_eq!(key, PipelineStateKey::default());
        assert_eq!(
            key.with_polygon_mode(vk::PolygonMode::LINE)
                .unwrap()
                .polygon_mode(),
            vk::PolygonMode::LINE
        );
    }

    #[test]
    fn render_targets_distinguish_keys() {
        let a = PipelineStateKey::default();
        let b = a.with_render_targets(RenderTargetFormats {
            color: vk::Format::R8G8B8A8_UNORM,
            depth: None,
        });
        assert_eq!(a.bits(), b.bits());
        assert_ne!(a, b);

        let set: HashSet<_> = [a, b, a].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn disabling_blend_clears_factors() {
        let blended = PipelineStateKey::default()
            .with_blend(Some(BlendFactors::alpha()))
            .unwrap();
        let opaque = blended.with_blend(None).unwrap();
        assert_eq!(opaque, PipelineStateKey::default());
    }
}
