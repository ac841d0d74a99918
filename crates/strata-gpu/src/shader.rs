//! Shader bytecode and stage masks.
//!
//! Compiling shader source is the job of a [`BytecodeProvider`]; this module
//! only carries and validates the resulting SPIR-V words.

use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::Arc;

/// SPIR-V magic number (little-endian first word).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A single programmable stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Vulkan stage flag for this stage.
    pub fn flag(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

bitflags! {
    /// Set of stages a binding is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u8 {
        const VERTEX   = 0b0000_0001;
        const FRAGMENT = 0b0000_0010;
        const COMPUTE  = 0b0000_0100;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

impl ShaderStages {
    /// Convert to Vulkan stage flags.
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        let mut flags = vk::ShaderStageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(Self::FRAGMENT) {
            flags |= vk::ShaderStageFlags::FRAGMENT;
        }
        if self.contains(Self::COMPUTE) {
            flags |= vk::ShaderStageFlags::COMPUTE;
        }
        flags
    }
}

impl From<ShaderStage> for ShaderStages {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => Self::VERTEX,
            ShaderStage::Fragment => Self::FRAGMENT,
            ShaderStage::Compute => Self::COMPUTE,
        }
    }
}

/// Compiled SPIR-V for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBytecode {
    stage: ShaderStage,
    words: Arc<[u32]>,
}

impl ShaderBytecode {
    /// Wrap SPIR-V words, checking the magic number.
    pub fn from_words(stage: ShaderStage, words: impl Into<Arc<[u32]>>) -> Result<Self> {
        let words = words.into();
        match words.first() {
            Some(&SPIRV_MAGIC) => Ok(Self { stage, words }),
            Some(&magic) => Err(GpuError::ShaderCompilation(format!(
                "{stage:?} bytecode has bad SPIR-V magic {magic:#010x}"
            ))),
            None => Err(GpuError::ShaderCompilation(format!(
                "{stage:?} bytecode is empty"
            ))),
        }
    }

    /// Wrap raw SPIR-V bytes (little-endian, length a multiple of four).
    pub fn from_bytes(stage: ShaderStage, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(GpuError::ShaderCompilation(format!(
                "{stage:?} bytecode length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Self::from_words(stage, words)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

/// Source of compiled bytecode, keyed by a logical shader name and stage.
pub trait BytecodeProvider {
    fn bytecode(&self, name: &str, stage: ShaderStage) -> Result<ShaderBytecode>;
}

/// In-memory bytecode provider.
#[derive(Debug, Default, Clone)]
pub struct ShaderLibrary {
    entries: HashMap<(String, ShaderStage), ShaderBytecode>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register bytecode under `name`, replacing any previous entry for the stage.
    pub fn insert(&mut self, name: impl Into<String>, bytecode: ShaderBytecode) {
        self.entries.insert((name.into(), bytecode.stage()), bytecode);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BytecodeProvider for ShaderLibrary {
    fn bytecode(&self, name: &str, stage: ShaderStage) -> Result<ShaderBytecode> {
        self.entries
            .get(&(name.to_string(), stage))
            .cloned()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("{stage:?} shader '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let err = ShaderBytecode::from_words(ShaderStage::Compute, vec![0xdead_beef, 0]);
        assert!(matches!(err, Err(GpuError::ShaderCompilation(_))));
    }

    #[test]
    fn rejects_unaligned_bytes() {
        let err = ShaderBytecode::from_bytes(ShaderStage::Vertex, &[0x03, 0x02, 0x23]);
        assert!(matches!(err, Err(GpuError::ShaderCompilation(_))));
    }

    #[test]
    fn bytes_decode_little_endian() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        let code = ShaderBytecode::from_bytes(ShaderStage::Fragment, &bytes).unwrap();
        assert_eq!(code.words(), &[SPIRV_MAGIC, 7]);
    }

    #[test]
    fn library_lookup_is_per_stage() {
        let mut library = ShaderLibrary::new();
        let code = ShaderBytecode::from_words(ShaderStage::Compute, vec![SPIRV_MAGIC]).unwrap();
        library.insert("add", code.clone());

        assert_eq!(library.bytecode("add", ShaderStage::Compute).unwrap(), code);
        assert!(library.bytecode("add", ShaderStage::Vertex).is_err());
    }

    #[test]
    fn stage_mask_converts() {
        let flags = ShaderStages::ALL_GRAPHICS.to_vk();
        assert_eq!(
            flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }
}
