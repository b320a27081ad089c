//! Pipelines, layouts and descriptor-set resource bindings.
//!
//! Pipeline descriptions are compiled through an ordered list of
//! [`PipelineCompiler`]s: the first compiler that accepts a shader produces
//! its SPIR-V. Compiled shader modules are cached by the content hash of the
//! pipeline description. `VkPipeline` objects for graphics pipelines are
//! instantiated lazily against the render pass they are first used with and
//! cached per (render pass, subpass).

use crate::error::{Error, Result};
use crate::ids::{DescriptorSetName, UniformId};
use crate::resource::{
    BufferId, DescriptorSetLayoutId, ImageId, RtSceneId, SamplerId,
};
use ash::vk;

/// Target format handed to pipeline compilers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShaderTargetFormat {
    #[default]
    SpirV13,
    SpirV14,
    SpirV15,
}

/// A single shader stage of a pipeline. Either carries precompiled SPIR-V or
/// source text for an external compiler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderDesc {
    pub stage: vk::ShaderStageFlags,
    pub entry_point: String,
    pub spirv: Option<Vec<u32>>,
    pub source: Option<String>,
}

impl ShaderDesc {
    pub fn from_spirv(stage: vk::ShaderStageFlags, spirv: Vec<u32>) -> ShaderDesc {
        ShaderDesc {
            stage,
            entry_point: "main".to_string(),
            spirv: Some(spirv),
            source: None,
        }
    }
}

pub type ShaderAcceptFn = fn(&ShaderDesc) -> bool;
pub type ShaderCompileFn = fn(&ShaderDesc, ShaderTargetFormat) -> Result<Vec<u32>>;

/// A pipeline compiler. Tagged variants with plain function pointers keep
/// ownership explicit; external collaborators register the `External`
/// variant.
#[derive(Copy, Clone)]
pub enum PipelineCompiler {
    /// Accepts shaders that already carry a SPIR-V payload.
    SpirvPassthrough,
    External {
        name: &'static str,
        accepts: ShaderAcceptFn,
        compile: ShaderCompileFn,
    },
}

impl PipelineCompiler {
    /// `None` when the compiler does not accept the shader at all.
    pub(crate) fn try_compile(
        &self,
        shader: &ShaderDesc,
        target: ShaderTargetFormat,
    ) -> Option<Result<Vec<u32>>> {
        match self {
            PipelineCompiler::SpirvPassthrough => shader.spirv.clone().map(Ok),
            PipelineCompiler::External {
                accepts, compile, ..
            } => accepts(shader).then(|| compile(shader, target)),
        }
    }
}

/// One binding of a descriptor-set layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub name: UniformId,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A descriptor-set layout, cacheable by structural hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// A pipeline layout, cacheable by structural hash over its set-layout ids
/// and push-constant ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<DescriptorSetLayoutId>,
    pub push_constants: Vec<PushConstantRange>,
}

/// A named descriptor set declared by a pipeline; the set index is the
/// position in [`GraphicsPipelineDesc::sets`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetDecl {
    pub name: DescriptorSetName,
    pub layout: DescriptorSetLayoutDesc,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// One vertex buffer of a pipeline's vertex input state. The Vulkan binding
/// slot is the layout's position in [`GraphicsPipelineDesc::vertex_buffers`];
/// draw tasks reference buffers by name and are remapped to that slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub name: crate::ids::VertexBufferName,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: vk::BlendFactor,
    pub dst_color_blend_factor: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend_factor: vk::BlendFactor,
    pub dst_alpha_blend_factor: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        ColorBlendAttachment {
            blend_enable: false,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ZERO,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    pub shaders: Vec<ShaderDesc>,
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    /// One entry per color attachment of the render pass the pipeline draws
    /// into.
    pub blend: Vec<ColorBlendAttachment>,
    pub sets: Vec<DescriptorSetDecl>,
    pub push_constants: Vec<PushConstantRange>,
    /// Extra dynamic states; viewport and scissor are always dynamic.
    pub dynamic_states: Vec<vk::DynamicState>,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        GraphicsPipelineDesc {
            shaders: vec![],
            vertex_buffers: vec![],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            blend: vec![ColorBlendAttachment::default()],
            sets: vec![],
            push_constants: vec![],
            dynamic_states: vec![],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComputePipelineDesc {
    pub shader: ShaderDesc,
    pub sets: Vec<DescriptorSetDecl>,
    pub push_constants: Vec<PushConstantRange>,
}

/// Shader groups of a ray-tracing pipeline; indices refer to
/// [`RayTracingPipelineDesc::shaders`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RtShaderGroup {
    /// Raygen, miss or callable shader.
    General { shader: u32 },
    TrianglesHit {
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RayTracingPipelineDesc {
    pub shaders: Vec<ShaderDesc>,
    pub groups: Vec<RtShaderGroup>,
    pub max_recursion_depth: u32,
    pub sets: Vec<DescriptorSetDecl>,
    pub push_constants: Vec<PushConstantRange>,
}

/// A resource bound (or to be bound) to one descriptor.
#[derive(Clone, Debug, Default)]
pub enum BoundResource {
    #[default]
    Empty,
    Buffer {
        id: BufferId,
        offset: u64,
        range: u64,
    },
    Image {
        id: ImageId,
        layout: vk::ImageLayout,
    },
    CombinedImageSampler {
        id: ImageId,
        layout: vk::ImageLayout,
        sampler: SamplerId,
    },
    Sampler(SamplerId),
    RtScene(RtSceneId),
}

#[derive(Clone, Debug)]
pub struct ResourceBinding {
    pub name: UniformId,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    pub resource: BoundResource,
}

/// A descriptor-set's worth of resource bindings, initialized from a
/// pipeline's layout and filled by the caller before a draw or dispatch.
#[derive(Clone, Debug, Default)]
pub struct PipelineResources {
    pub(crate) set_layout: DescriptorSetLayoutId,
    pub(crate) set_index: u32,
    pub(crate) bindings: Vec<ResourceBinding>,
}

impl PipelineResources {
    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    fn binding_mut(&mut self, name: UniformId) -> Result<&mut ResourceBinding> {
        self.bindings
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::Configuration {
                name: name.as_str().to_string(),
                reason: "no descriptor with this name in the set layout".to_string(),
            })
    }

    pub fn bind_buffer(&mut self, name: UniformId, id: BufferId, offset: u64, range: u64) -> Result<()> {
        let binding = self.binding_mut(name)?;
        match binding.descriptor_type {
            vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                binding.resource = BoundResource::Buffer { id, offset, range };
                Ok(())
            }
            other => Err(Error::Configuration {
                name: name.as_str().to_string(),
                reason: format!("descriptor type {other:?} does not accept a buffer"),
            }),
        }
    }

    pub fn bind_image(&mut self, name: UniformId, id: ImageId, layout: vk::ImageLayout) -> Result<()> {
        let binding = self.binding_mut(name)?;
        match binding.descriptor_type {
            vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT => {
                binding.resource = BoundResource::Image { id, layout };
                Ok(())
            }
            other => Err(Error::Configuration {
                name: name.as_str().to_string(),
                reason: format!("descriptor type {other:?} does not accept an image"),
            }),
        }
    }

    pub fn bind_combined_image_sampler(
        &mut self,
        name: UniformId,
        id: ImageId,
        layout: vk::ImageLayout,
        sampler: SamplerId,
    ) -> Result<()> {
        let binding = self.binding_mut(name)?;
        if binding.descriptor_type != vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
            return Err(Error::Configuration {
                name: name.as_str().to_string(),
                reason: format!(
                    "descriptor type {:?} is not COMBINED_IMAGE_SAMPLER",
                    binding.descriptor_type
                ),
            });
        }
        binding.resource = BoundResource::CombinedImageSampler { id, layout, sampler };
        Ok(())
    }

    pub fn bind_sampler(&mut self, name: UniformId, sampler: SamplerId) -> Result<()> {
        let binding = self.binding_mut(name)?;
        if binding.descriptor_type != vk::DescriptorType::SAMPLER {
            return Err(Error::Configuration {
                name: name.as_str().to_string(),
                reason: format!("descriptor type {:?} is not SAMPLER", binding.descriptor_type),
            });
        }
        binding.resource = BoundResource::Sampler(sampler);
        Ok(())
    }

    pub fn bind_rt_scene(&mut self, name: UniformId, scene: RtSceneId) -> Result<()> {
        let binding = self.binding_mut(name)?;
        if binding.descriptor_type != vk::DescriptorType::ACCELERATION_STRUCTURE_KHR {
            return Err(Error::Configuration {
                name: name.as_str().to_string(),
                reason: format!(
                    "descriptor type {:?} is not ACCELERATION_STRUCTURE_KHR",
                    binding.descriptor_type
                ),
            });
        }
        binding.resource = BoundResource::RtScene(scene);
        Ok(())
    }

    /// Populates the binding array from a set-layout description; every
    /// binding starts [`BoundResource::Empty`].
    pub(crate) fn initialize(
        &mut self,
        set_layout: DescriptorSetLayoutId,
        set_index: u32,
        desc: &DescriptorSetLayoutDesc,
    ) {
        self.set_layout = set_layout;
        self.set_index = set_index;
        self.bindings = desc
            .bindings
            .iter()
            .map(|b| ResourceBinding {
                name: b.name,
                binding: b.binding,
                descriptor_type: b.descriptor_type,
                stages: b.stages,
                resource: BoundResource::Empty,
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_desc() -> DescriptorSetLayoutDesc {
        DescriptorSetLayoutDesc {
            bindings: vec![
                DescriptorBinding {
                    name: UniformId::new("u_params"),
                    binding: 0,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    count: 1,
                    stages: vk::ShaderStageFlags::COMPUTE,
                },
                DescriptorBinding {
                    name: UniformId::new("u_input"),
                    binding: 1,
                    descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                    count: 1,
                    stages: vk::ShaderStageFlags::COMPUTE,
                },
            ],
        }
    }

    #[test]
    fn bindings_initialize_empty_and_type_check() {
        let mut resources = PipelineResources::default();
        resources.initialize(DescriptorSetLayoutId::default(), 0, &layout_desc());
        assert_eq!(resources.bindings.len(), 2);
        assert!(matches!(resources.bindings[0].resource, BoundResource::Empty));

        // binding a buffer to the storage-image descriptor is a configuration error
        let err = resources.bind_buffer(UniformId::new("u_input"), BufferId::default(), 0, 16);
        assert!(matches!(err, Err(Error::Configuration { .. })));

        resources
            .bind_buffer(UniformId::new("u_params"), BufferId::default(), 0, 64)
            .unwrap();
        assert!(matches!(
            resources.bindings[0].resource,
            BoundResource::Buffer { range: 64, .. }
        ));
    }

    #[test]
    fn unknown_uniform_name_is_rejected() {
        let mut resources = PipelineResources::default();
        resources.initialize(DescriptorSetLayoutId::default(), 0, &layout_desc());
        let err = resources.bind_sampler(UniformId::new("nope"), SamplerId::default());
        assert!(matches!(err, Err(Error::Configuration { .. })));
    }

    #[test]
    fn passthrough_compiler_accepts_only_spirv() {
        let with_spirv = ShaderDesc::from_spirv(vk::ShaderStageFlags::VERTEX, vec![0x0723_0203]);
        let source_only = ShaderDesc {
            stage: vk::ShaderStageFlags::VERTEX,
            entry_point: "main".into(),
            spirv: None,
            source: Some("void main() {}".into()),
        };
        let compiler = PipelineCompiler::SpirvPassthrough;
        assert!(compiler
            .try_compile(&with_spirv, ShaderTargetFormat::default())
            .is_some());
        assert!(compiler
            .try_compile(&source_only, ShaderTargetFormat::default())
            .is_none());
    }
}
