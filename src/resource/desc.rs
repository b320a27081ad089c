//! Resource descriptions.
//!
//! Descriptions are immutable after creation and can be read back at any time
//! through the manager. Cacheable kinds (samplers, render passes, layouts)
//! hash their entire description; equality is structural, never by Vulkan
//! handle.

use ash::vk;
use std::hash::{Hash, Hasher};

/// Parameters of a buffer resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferDesc {
    pub byte_size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Map the memory for host access for the buffer's whole lifetime.
    /// Ignored for memory locations that cannot be mapped.
    pub map_on_create: bool,
}

/// Parameters of an image resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub usage: vk::ImageUsageFlags,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Mipmap chain length. Contents of levels > 0 must still be generated.
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub tiling: vk::ImageTiling,
}

impl Default for ImageDesc {
    fn default() -> Self {
        ImageDesc {
            image_type: vk::ImageType::TYPE_2D,
            usage: vk::ImageUsageFlags::empty(),
            format: vk::Format::UNDEFINED,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            tiling: vk::ImageTiling::OPTIMAL,
        }
    }
}

impl ImageDesc {
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> ImageDesc {
        ImageDesc {
            format,
            width,
            height,
            usage,
            ..Default::default()
        }
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }

    pub(crate) fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }
}

/// Parameters of a sampler. Content-addressed: two descriptions with equal
/// fields yield the same sampler id.
#[derive(Copy, Clone, Debug)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        SamplerDesc {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            mip_lod_bias: 0.0,
            anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

// Float fields compare by bit pattern so that the dedup index never splits on
// NaN and hashing agrees with equality.
impl PartialEq for SamplerDesc {
    fn eq(&self, other: &Self) -> bool {
        self.mag_filter == other.mag_filter
            && self.min_filter == other.min_filter
            && self.mipmap_mode == other.mipmap_mode
            && self.address_mode_u == other.address_mode_u
            && self.address_mode_v == other.address_mode_v
            && self.address_mode_w == other.address_mode_w
            && self.mip_lod_bias.to_bits() == other.mip_lod_bias.to_bits()
            && self.anisotropy.map(f32::to_bits) == other.anisotropy.map(f32::to_bits)
            && self.compare_op == other.compare_op
            && self.min_lod.to_bits() == other.min_lod.to_bits()
            && self.max_lod.to_bits() == other.max_lod.to_bits()
            && self.border_color == other.border_color
            && self.unnormalized_coordinates == other.unnormalized_coordinates
    }
}

impl Eq for SamplerDesc {}

impl Hash for SamplerDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mag_filter.hash(state);
        self.min_filter.hash(state);
        self.mipmap_mode.hash(state);
        self.address_mode_u.hash(state);
        self.address_mode_v.hash(state);
        self.address_mode_w.hash(state);
        state.write_u32(self.mip_lod_bias.to_bits());
        self.anisotropy.map(f32::to_bits).hash(state);
        self.compare_op.hash(state);
        state.write_u32(self.min_lod.to_bits());
        state.write_u32(self.max_lod.to_bits());
        self.border_color.hash(state);
        self.unnormalized_coordinates.hash(state);
    }
}

impl SamplerDesc {
    pub(crate) fn to_vk(&self) -> vk::SamplerCreateInfo {
        vk::SamplerCreateInfo {
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_mode: self.mipmap_mode,
            address_mode_u: self.address_mode_u,
            address_mode_v: self.address_mode_v,
            address_mode_w: self.address_mode_w,
            mip_lod_bias: self.mip_lod_bias,
            anisotropy_enable: self.anisotropy.is_some() as u32,
            max_anisotropy: self.anisotropy.unwrap_or(0.0),
            compare_enable: self.compare_op.is_some() as u32,
            compare_op: self.compare_op.unwrap_or(vk::CompareOp::NEVER),
            min_lod: self.min_lod,
            max_lod: self.max_lod,
            border_color: self.border_color,
            unnormalized_coordinates: self.unnormalized_coordinates as u32,
            ..Default::default()
        }
    }
}

/// Parameters of a ray-tracing geometry (bottom-level acceleration
/// structure). Only the size class is tracked here; build inputs arrive with
/// the build task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RtGeometryDesc {
    /// Conservative acceleration-structure buffer size, in bytes.
    pub size: u64,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
}

/// Parameters of a ray-tracing scene (top-level acceleration structure).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RtSceneDesc {
    pub size: u64,
    pub max_instances: u32,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(desc: &SamplerDesc) -> u64 {
        let mut h = DefaultHasher::new();
        desc.hash(&mut h);
        h.finish()
    }

    #[test]
    fn sampler_desc_structural_equality() {
        let a = SamplerDesc::default();
        let b = SamplerDesc::default();
        let c = SamplerDesc {
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            ..Default::default()
        };
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn nan_lod_bias_still_compares_equal() {
        let a = SamplerDesc {
            mip_lod_bias: f32::NAN,
            ..Default::default()
        };
        let b = SamplerDesc {
            mip_lod_bias: f32::NAN,
            ..Default::default()
        };
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }
}
