//! Shader modules.
//!
//! The RHI consumes SPIR-V only; preprocessing and compilation happen
//! upstream. Modules are cached by the hash of stage, entry point and code
//! in the [`ResourcePoolRegistry`](crate::registry::ResourcePoolRegistry).

use std::ffi::{CStr, CString};
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};

/// Shader stage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Geometry,
    TessControl,
    TessEvaluation,
}

impl ShaderStage {
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
            ShaderStage::Geometry => "geometry",
            ShaderStage::TessControl => "tessellation control",
            ShaderStage::TessEvaluation => "tessellation evaluation",
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Compiled SPIR-V for one stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderDesc {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub code: Vec<u32>,
}

impl ShaderDesc {
    pub fn new(stage: ShaderStage, code: Vec<u32>) -> Self {
        Self {
            stage,
            entry_point: "main".to_string(),
            code,
        }
    }

    /// Reinterprets little-endian SPIR-V bytes as code words.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderError`] if the length is not a multiple of 4
    /// or the SPIR-V magic number is missing.
    pub fn from_spirv_bytes(stage: ShaderStage, bytes: &[u8]) -> RhiResult<Self> {
        if !bytes.len().is_multiple_of(4) {
            return Err(RhiError::ShaderError(format!(
                "SPIR-V code must be 4-byte aligned, got {} bytes",
                bytes.len()
            )));
        }

        let code: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(RhiError::ShaderError(format!(
                "{} shader is not SPIR-V (bad magic number)",
                stage
            )));
        }
        Ok(Self::new(stage, code))
    }

    pub fn from_spirv_file(stage: ShaderStage, path: &Path) -> RhiResult<Self> {
        debug!("Loading {} shader from {:?}", stage, path);
        let bytes = std::fs::read(path).map_err(|e| {
            RhiError::ShaderError(format!("Failed to read shader file {:?}: {}", path, e))
        })?;
        Self::from_spirv_bytes(stage, &bytes)
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A native shader module.
pub struct ShaderModule {
    device: Arc<dyn GpuDevice>,
    module: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
    hash: u64,
}

impl ShaderModule {
    pub(crate) fn create(device: Arc<dyn GpuDevice>, desc: &ShaderDesc, hash: u64) -> RhiResult<Self> {
        let entry_point = CString::new(desc.entry_point.as_str())
            .map_err(|e| RhiError::ShaderError(format!("Invalid entry point name: {}", e)))?;
        if desc.code.is_empty() {
            return Err(RhiError::ShaderError(format!("{} shader has no code", desc.stage)));
        }

        let module = device.create_shader_module(&desc.code)?;
        debug!(
            "Created {} shader module with entry point '{}'",
            desc.stage, desc.entry_point
        );

        Ok(Self {
            device,
            module,
            stage: desc.stage,
            entry_point,
            hash,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.module);
        debug!("Destroyed {} shader module", self.stage);
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("stage", &self.stage)
            .field("entry_point", &self.entry_point)
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_stage_to_vk() {
        assert_eq!(ShaderStage::Vertex.to_vk_stage(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderStage::Fragment.to_vk_stage(), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(ShaderStage::Compute.to_vk_stage(), vk::ShaderStageFlags::COMPUTE);
        assert_eq!(
            ShaderStage::TessEvaluation.to_vk_stage(),
            vk::ShaderStageFlags::TESSELLATION_EVALUATION
        );
    }

    #[test]
    fn test_shader_stage_display() {
        assert_eq!(format!("{}", ShaderStage::Vertex), "vertex");
        assert_eq!(format!("{}", ShaderStage::TessControl), "tessellation control");
    }

    #[test]
    fn test_from_spirv_bytes_rejects_misaligned() {
        let result = ShaderDesc::from_spirv_bytes(ShaderStage::Vertex, &[0x03, 0x02, 0x23]);
        assert!(matches!(result, Err(RhiError::ShaderError(_))));
    }

    #[test]
    fn test_from_spirv_bytes_checks_magic() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let desc = ShaderDesc::from_spirv_bytes(ShaderStage::Fragment, &bytes).unwrap();
        assert_eq!(desc.code, vec![SPIRV_MAGIC, 0x0001_0000]);
        assert_eq!(desc.entry_point, "main");

        assert!(ShaderDesc::from_spirv_bytes(ShaderStage::Fragment, &[0u8; 8]).is_err());
    }
}
