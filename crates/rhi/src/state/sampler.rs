//! Sampler state.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;

use crate::device::GpuDevice;
use crate::error::RhiResult;
use crate::state::fixed_function::CompareOp;

/// Filtering and addressing of a sampler.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerStateDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
    pub address_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    /// Maximum anisotropy; `None` disables anisotropic filtering.
    pub max_anisotropy: Option<f32>,
    /// Depth compare function for shadow samplers.
    pub compare_op: Option<CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerStateDesc {
    fn default() -> Self {
        Self::linear_repeat()
    }
}

impl SamplerStateDesc {
    /// Trilinear filtering, repeat addressing.
    pub fn linear_repeat() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_u: vk::SamplerAddressMode::REPEAT,
            address_v: vk::SamplerAddressMode::REPEAT,
            address_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
        }
    }

    /// Point filtering, clamp-to-edge addressing. Used for reading G-buffers.
    pub fn nearest_clamp() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ..Self::linear_repeat()
        }
    }

    /// Linear depth comparison with a white border, for shadow maps.
    pub fn shadow() -> Self {
        Self {
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_u: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            address_v: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            address_w: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            compare_op: Some(CompareOp::LessOrEqual),
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            ..Self::linear_repeat()
        }
    }

    pub fn with_anisotropy(mut self, max: f32) -> Self {
        self.max_anisotropy = Some(max);
        self
    }
}

impl Hash for SamplerStateDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mag_filter.hash(state);
        self.min_filter.hash(state);
        self.mipmap_mode.hash(state);
        self.address_u.hash(state);
        self.address_v.hash(state);
        self.address_w.hash(state);
        self.mip_lod_bias.to_bits().hash(state);
        self.max_anisotropy.map(f32::to_bits).hash(state);
        self.compare_op.hash(state);
        self.min_lod.to_bits().hash(state);
        self.max_lod.to_bits().hash(state);
        self.border_color.hash(state);
    }
}

/// A native sampler built from a [`SamplerStateDesc`].
pub struct SamplerState {
    device: Arc<dyn GpuDevice>,
    desc: SamplerStateDesc,
    hash: u64,
    handle: vk::Sampler,
}

impl SamplerState {
    pub(crate) fn create(
        device: Arc<dyn GpuDevice>,
        desc: &SamplerStateDesc,
        hash: u64,
    ) -> RhiResult<Self> {
        let handle = device.create_sampler(desc)?;
        Ok(Self {
            device,
            desc: desc.clone(),
            hash,
            handle,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    #[inline]
    pub fn desc(&self) -> &SamplerStateDesc {
        &self.desc
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl Drop for SamplerState {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.handle);
    }
}

impl std::fmt::Debug for SamplerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerState")
            .field("handle", &self.handle)
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::description_hash;

    #[test]
    fn test_presets_hash_differently() {
        let a = description_hash(&SamplerStateDesc::linear_repeat());
        let b = description_hash(&SamplerStateDesc::nearest_clamp());
        let c = description_hash(&SamplerStateDesc::shadow());
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_anisotropy_changes_hash() {
        let plain = SamplerStateDesc::linear_repeat();
        let aniso = SamplerStateDesc::linear_repeat().with_anisotropy(16.0);
        assert_ne!(description_hash(&plain), description_hash(&aniso));
        assert_eq!(description_hash(&aniso), description_hash(&aniso.clone()));
    }

    #[test]
    fn test_default_is_linear_repeat() {
        assert_eq!(SamplerStateDesc::default(), SamplerStateDesc::linear_repeat());
    }
}
